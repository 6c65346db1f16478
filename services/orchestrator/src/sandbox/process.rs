//! Worker runtime backed by real, confined processes.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use chainbox_id::Kind;
use tracing::{debug, info};

use super::{platform, WorkerRuntime, WorkerSpec};
use crate::error::{Error, Result};
use crate::proxy::NodeTransport;

/// Version prefix reported by a ready node.
const NODE_VERSION_PREFIX: &str = "anvil/";

/// Runs workers as sandboxed child processes.
pub struct SandboxRuntime {
    transport: NodeTransport,
}

impl SandboxRuntime {
    pub fn new(transport: NodeTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl WorkerRuntime for SandboxRuntime {
    async fn spawn_worker(&self, spec: &WorkerSpec, lock: &File) -> Result<u32> {
        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .env_clear()
            .envs(spec.command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&spec.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        platform::confine(&mut cmd, lock.as_raw_fd(), spec.identity);

        // Forked from this runtime thread rather than a blocking-pool thread:
        // the parent-death signal follows the thread that forked.
        let child = cmd.spawn().map_err(|e| {
            Error::Spawn(format!("{}: {e}", spec.command.program.display()))
        })?;
        let pid = child.id();

        info!(
            instance = %spec.instance,
            kind = %spec.kind,
            port = spec.port,
            pid,
            uid = spec.identity.map(|i| i.uid),
            "Spawned worker"
        );
        Ok(pid)
    }

    async fn kill_worker(&self, pid: u32) -> Result<()> {
        debug!(pid, "Killing worker");
        platform::kill_process(pid).map_err(|e| Error::Spawn(format!("kill {pid}: {e}")))
    }

    async fn reap_worker(&self, pid: u32) -> Result<()> {
        tokio::task::spawn_blocking(move || platform::reap_process(pid))
            .await
            .map_err(|e| Error::Spawn(format!("reap task for {pid} failed: {e}")))?
            .map_err(|e| Error::Spawn(format!("waitpid {pid}: {e}")))
    }

    async fn check_worker_health(&self, kind: Kind, port: u16) -> Result<bool> {
        if !kind.is_node() {
            return Ok(true);
        }
        match self.transport.client_version(port).await {
            Ok(version) => Ok(version.starts_with(NODE_VERSION_PREFIX)),
            Err(e) => {
                debug!(port, error = %e, "Node not answering yet");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::WorkerCommand;
    use chainbox_id::{IdentitySecret, InstanceKey};
    use fs2::FileExt;
    use nix::unistd::{getsid, Pid};

    #[tokio::test]
    async fn worker_keeps_lock_in_its_own_session_until_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let lock = File::create(&path).unwrap();
        lock.lock_exclusive().unwrap();

        let runtime = SandboxRuntime::new(NodeTransport::new("127.0.0.1").unwrap());
        let spec = WorkerSpec {
            instance: InstanceKey::derive(
                &IdentitySecret::new(b"k".to_vec()).unwrap(),
                "t",
                Kind::L1,
            ),
            kind: Kind::L1,
            port: 1024,
            workspace: dir.path().to_path_buf(),
            command: WorkerCommand {
                program: "/bin/sleep".into(),
                args: vec!["30".to_string()],
                env: vec![],
            },
            identity: None,
        };
        let pid = runtime.spawn_worker(&spec, &lock).await.unwrap();
        drop(lock);

        let contender = File::open(&path).unwrap();
        assert!(contender.try_lock_exclusive().is_err());

        let worker = Pid::from_raw(pid as i32);
        assert_eq!(getsid(Some(worker)).unwrap(), worker);

        runtime.kill_worker(pid).await.unwrap();
        runtime.reap_worker(pid).await.unwrap();
        assert!(contender.try_lock_exclusive().is_ok());
    }
}
