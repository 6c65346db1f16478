//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chainbox_id::IdentitySecret;
use chainbox_orchestrator::registry::InstanceRegistry;
use chainbox_orchestrator::sandbox::MockRuntime;
use chainbox_orchestrator::supervisor::{NodeSettings, ProcessSupervisor, SupervisorConfig};
use tempfile::TempDir;

pub const L1_SEED: &str = r#"{"block":{"number":"0x0"},"l1":true}"#;
pub const L2_SEED: &str = r#"{"block":{"number":"0x0"},"l2":true}"#;

/// Workdir, templates, registry, mock runtime and supervisor.
pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<InstanceRegistry>,
    pub runtime: Arc<MockRuntime>,
    pub supervisor: Arc<ProcessSupervisor>,
}

impl Harness {
    pub fn new(ports: std::ops::Range<u16>) -> Self {
        Self::with_runtime(ports, MockRuntime::new())
    }

    pub fn with_runtime(ports: std::ops::Range<u16>, runtime: MockRuntime) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let l1_template = dir.path().join("l1-state.json");
        let l2_template = dir.path().join("l2-state.json");
        std::fs::write(&l1_template, L1_SEED).unwrap();
        std::fs::write(&l2_template, L2_SEED).unwrap();

        let secret = IdentitySecret::new(b"integration-secret".to_vec()).unwrap();
        let registry = Arc::new(InstanceRegistry::new(
            dir.path().join("work"),
            secret,
            ports.clone(),
        ));
        let runtime = Arc::new(runtime);

        let config = SupervisorConfig {
            ready_retries: 3,
            ready_interval: Duration::from_millis(10),
            port_range_start: ports.start,
            uid_base: None,
            l1: NodeSettings {
                binary: PathBuf::from("/opt/foundry/bin/anvil"),
                state_template: l1_template,
            },
            l2: NodeSettings {
                binary: PathBuf::from("/app/anvil"),
                state_template: l2_template,
            },
            relay_program: PathBuf::from("/usr/local/bin/chainboxd"),
            relay_env: vec![("CHAINBOX_BRIDGE_ADDRESS".to_string(), "0x15".to_string())],
        };
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&registry),
            runtime.clone(),
            config,
        ));

        Self {
            dir,
            registry,
            runtime,
            supervisor,
        }
    }
}

/// Executable that answers `cast block-number` with `block` and
/// `cast call` with `call_output`.
pub fn fake_cast(dir: &Path, block: u64, call_output: &str) -> PathBuf {
    let path = dir.join("cast");
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n  block-number) echo {block} ;;\n  call) echo '{call_output}' ;;\n  *) exit 1 ;;\nesac\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
