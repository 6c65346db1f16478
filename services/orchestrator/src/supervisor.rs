//! Process supervisor.
//!
//! Lifecycle of one instance: `STOPPED -> STARTING -> READY`, and back to
//! `STOPPED` on kill or crash. The workspace's readiness lock is the only
//! cross-process exclusion: whoever takes it may start a worker, and the
//! worker keeps it until it dies. Inside this process, callers for the same
//! instance are additionally queued so a caller that loses a start race
//! observes the winner's result instead of a half-started worker.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainbox_id::{InstanceKey, Kind};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lockfile::{LockAttempt, ReadinessLock};
use crate::registry::{InstanceRegistry, Workspace};
use crate::sandbox::{self, SandboxIdentity, WorkerCommand, WorkerRuntime, WorkerSpec};

/// Node ports the relayer connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPeers {
    pub l1_port: u16,
    pub l2_port: u16,
}

/// An instance as the supervisor sees it.
#[derive(Debug, Clone)]
pub struct Instance {
    pub key: InstanceKey,
    pub kind: Kind,
    /// Required to start a relayer.
    pub peers: Option<RelayPeers>,
}

impl Instance {
    pub fn new(key: InstanceKey, kind: Kind) -> Self {
        Self {
            key,
            kind,
            peers: None,
        }
    }

    pub fn with_peers(mut self, peers: RelayPeers) -> Self {
        self.peers = Some(peers);
        self
    }
}

/// Binary and state seed of one node kind.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub binary: PathBuf,
    pub state_template: PathBuf,
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Readiness checks before giving up.
    pub ready_retries: u32,

    /// Spacing between checks.
    pub ready_interval: Duration,

    /// First port of the lease range; anchors sandbox identities.
    pub port_range_start: u16,

    /// Drop workers to `uid_base + port offset` when set.
    pub uid_base: Option<u32>,

    pub l1: NodeSettings,
    pub l2: NodeSettings,

    /// Program re-executed for relayer workers.
    pub relay_program: PathBuf,

    /// Environment of relayer workers.
    pub relay_env: Vec<(String, String)>,
}

impl SupervisorConfig {
    /// Derive supervisor settings from the service configuration.
    ///
    /// Privileges are only dropped when running as root.
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        Ok(Self {
            ready_retries: config.ready_retries,
            ready_interval: config.ready_interval,
            port_range_start: config.port_range.start,
            uid_base: sandbox::is_root().then_some(config.uid_base),
            l1: NodeSettings {
                binary: config.l1_node_binary.clone(),
                state_template: config.l1_state_template.clone(),
            },
            l2: NodeSettings {
                binary: config.l2_node_binary.clone(),
                state_template: config.l2_state_template.clone(),
            },
            relay_program: std::env::current_exe()?,
            relay_env: config.relay.worker_env(),
        })
    }

    fn node(&self, kind: Kind) -> Option<&NodeSettings> {
        match kind {
            Kind::L1 => Some(&self.l1),
            Kind::L2 => Some(&self.l2),
            Kind::Relayer => None,
        }
    }
}

/// Starts, health-checks and kills instance workers.
pub struct ProcessSupervisor {
    registry: Arc<InstanceRegistry>,
    runtime: Arc<dyn WorkerRuntime>,
    config: SupervisorConfig,
    gates: Mutex<HashMap<InstanceKey, Arc<AsyncMutex<()>>>>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        runtime: Arc<dyn WorkerRuntime>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Returns true if the instance's worker is up and completed its handshake.
    ///
    /// With `start_if_not`, a stopped instance is started first. A worker
    /// that is alive but still starting (in another process) reads as
    /// not ready.
    pub async fn ready(&self, instance: &Instance, start_if_not: bool) -> Result<bool> {
        let gate = self.gate(&instance.key);
        let _queued = gate.lock().await;

        let workspace = self.registry.ensure_workspace(&instance.key)?;
        let lock = match ReadinessLock::try_acquire(&workspace.status_path())? {
            LockAttempt::Held { ready } => return Ok(ready),
            LockAttempt::Acquired(lock) => lock,
        };

        if !start_if_not {
            return Ok(false);
        }
        self.start(instance, &workspace, lock).await
    }

    /// Stop the instance's worker and reset its chain state. Idempotent.
    pub async fn kill(&self, instance: &Instance) -> Result<()> {
        let gate = self.gate(&instance.key);
        let _queued = gate.lock().await;
        self.kill_locked(instance).await
    }

    async fn start(
        &self,
        instance: &Instance,
        workspace: &Workspace,
        lock: ReadinessLock,
    ) -> Result<bool> {
        let key = &instance.key;
        if instance.kind == Kind::Relayer && instance.peers.is_none() {
            return Err(Error::InvalidArgument(
                "relayer needs the L1 and L2 ports".to_string(),
            ));
        }

        info!(instance = %key, kind = %instance.kind, "Starting worker");

        self.registry.reset_transient(key)?;
        if let Some(node) = self.config.node(instance.kind) {
            let chain_state = workspace.chain_state_path();
            if !chain_state.exists() {
                reset_chain_state(&node.state_template, &chain_state)?;
            }
        }
        lock.clear_status()?;

        let port = match self.registry.port(key)? {
            Some(port) => port,
            None => {
                let port = self.registry.lease_port(key).await?;
                self.registry.set_port(key, port)?;
                port
            }
        };

        let spec = self.worker_spec(instance, workspace, port)?;
        if let Some(identity) = spec.identity {
            if instance.kind.is_node() {
                sandbox::hand_over(&workspace.chain_state_path(), identity)?;
            }
        }

        let pid = self.runtime.spawn_worker(&spec, lock.file()).await?;
        if let Err(e) = self.registry.set_pid(key, pid) {
            warn!(instance = %key, pid, error = %e, "Could not record worker, killing it");
            self.runtime.kill_worker(pid).await?;
            self.runtime.reap_worker(pid).await?;
            return Err(e);
        }

        let attempts = self.config.ready_retries;
        for attempt in 1..=attempts {
            match self.runtime.check_worker_health(instance.kind, port).await {
                Ok(true) => {
                    lock.mark_ready()?;
                    info!(instance = %key, kind = %instance.kind, port, pid, attempt, "Worker ready");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => debug!(instance = %key, error = %e, "Readiness check failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.ready_interval).await;
            }
        }

        warn!(instance = %key, kind = %instance.kind, port, pid, attempts, "Worker never became ready");
        drop(lock);
        self.kill_locked(instance).await?;
        Err(Error::StartTimeout {
            instance: key.clone(),
            attempts,
        })
    }

    async fn kill_locked(&self, instance: &Instance) -> Result<()> {
        let key = &instance.key;
        let workspace = self.registry.ensure_workspace(key)?;
        let pid = self.registry.pid(key)?;

        if pid > 0 {
            self.runtime.kill_worker(pid).await?;
            if let Some(node) = self.config.node(instance.kind) {
                reset_chain_state(&node.state_template, &workspace.chain_state_path())?;
            }
            self.runtime.reap_worker(pid).await?;
            info!(instance = %key, kind = %instance.kind, pid, "Killed worker");
        }

        self.registry.set_pid(key, 0)
    }

    fn worker_spec(&self, instance: &Instance, workspace: &Workspace, port: u16) -> Result<WorkerSpec> {
        let command = match (self.config.node(instance.kind), instance.kind.chain_id()) {
            (Some(node), Some(chain_id)) => WorkerCommand {
                program: node.binary.clone(),
                args: node_args(&workspace.chain_state_path(), chain_id, port),
                env: Vec::new(),
            },
            _ => {
                let peers = instance.peers.ok_or_else(|| {
                    Error::InvalidArgument("relayer needs the L1 and L2 ports".to_string())
                })?;
                WorkerCommand {
                    program: self.config.relay_program.clone(),
                    args: vec![
                        "relay".to_string(),
                        "--l1-port".to_string(),
                        peers.l1_port.to_string(),
                        "--l2-port".to_string(),
                        peers.l2_port.to_string(),
                    ],
                    env: self.config.relay_env.clone(),
                }
            }
        };

        Ok(WorkerSpec {
            instance: instance.key.clone(),
            kind: instance.kind,
            port,
            workspace: workspace.root().to_path_buf(),
            command,
            identity: self
                .config
                .uid_base
                .map(|base| SandboxIdentity::for_port(port, self.config.port_range_start, base)),
        })
    }

    fn gate(&self, key: &InstanceKey) -> Gate<'_> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Gate {
            gates: &self.gates,
            key: key.clone(),
            queue: Arc::clone(gates.entry(key.clone()).or_default()),
        }
    }
}

/// Place in an instance's queue. The last one out removes the queue.
struct Gate<'a> {
    gates: &'a Mutex<HashMap<InstanceKey, Arc<AsyncMutex<()>>>>,
    key: InstanceKey,
    queue: Arc<AsyncMutex<()>>,
}

impl Gate<'_> {
    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.queue.lock().await
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        // held by the map and this gate only
        if Arc::strong_count(&self.queue) == 2 {
            gates.remove(&self.key);
        }
    }
}

/// Fixed node argv: no funded accounts, periodic state dumps, fixed chain id.
fn node_args(chain_state: &Path, chain_id: u64, port: u16) -> Vec<String> {
    vec![
        "--balance".to_string(),
        "0".to_string(),
        "-a".to_string(),
        "0".to_string(),
        "--state".to_string(),
        chain_state.display().to_string(),
        "--state-interval".to_string(),
        "5".to_string(),
        "--chain-id".to_string(),
        chain_id.to_string(),
        "--port".to_string(),
        port.to_string(),
    ]
}

/// Write the template's content into the chain state, keeping the file's
/// owner and mode if it already exists.
fn reset_chain_state(template: &Path, chain_state: &Path) -> Result<()> {
    let seed = fs::read(template)?;
    fs::write(chain_state, seed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MockRuntime;
    use chainbox_id::IdentitySecret;

    fn supervisor(dir: &Path, runtime: MockRuntime) -> ProcessSupervisor {
        let template = dir.join("state.json");
        fs::write(&template, "{}").unwrap();
        let node = NodeSettings {
            binary: PathBuf::from("anvil"),
            state_template: template,
        };
        let registry = Arc::new(InstanceRegistry::new(
            dir.join("work"),
            IdentitySecret::new(b"gates".to_vec()).unwrap(),
            41460..41470,
        ));
        let config = SupervisorConfig {
            ready_retries: 2,
            ready_interval: Duration::from_millis(5),
            port_range_start: 41460,
            uid_base: None,
            l1: node.clone(),
            l2: node,
            relay_program: PathBuf::from("chainboxd"),
            relay_env: Vec::new(),
        };
        ProcessSupervisor::new(registry, Arc::new(runtime), config)
    }

    fn tracked_gates(supervisor: &ProcessSupervisor) -> usize {
        supervisor.gates.lock().unwrap().len()
    }

    #[tokio::test]
    async fn gates_are_dropped_once_idle() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(
            dir.path(),
            MockRuntime::new().with_spawn_delay(Duration::from_millis(30)),
        );
        let a = Instance::new(supervisor.registry().identity("a", Kind::L1), Kind::L1);
        let b = Instance::new(supervisor.registry().identity("b", Kind::L2), Kind::L2);

        assert!(!supervisor.ready(&a, false).await.unwrap());
        supervisor.kill(&b).await.unwrap();
        assert_eq!(tracked_gates(&supervisor), 0);

        let (first, second, other) = tokio::join!(
            supervisor.ready(&a, true),
            supervisor.ready(&a, true),
            supervisor.ready(&b, true),
        );
        assert!(first.unwrap() && second.unwrap() && other.unwrap());
        assert_eq!(tracked_gates(&supervisor), 0);
    }

    #[test]
    fn node_argv_contract() {
        let args = node_args(Path::new("/w/chain-state.json"), 78704, 1030);
        assert_eq!(
            args.join(" "),
            "--balance 0 -a 0 --state /w/chain-state.json --state-interval 5 --chain-id 78704 --port 1030"
        );
    }
}
