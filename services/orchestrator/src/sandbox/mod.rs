//! Worker runtime interface and mock implementation.
//!
//! The runtime abstracts worker process lifecycle operations:
//! - Spawning a confined worker that inherits the readiness lock
//! - Killing and reaping it
//! - Health checks for the readiness handshake
//!
//! [`SandboxRuntime`] runs real processes. [`MockRuntime`] is provided for
//! testing and keeps no processes at all.

mod platform;
mod process;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chainbox_id::{InstanceKey, Kind};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use platform::{hand_over, is_root};
pub use process::SandboxRuntime;

/// Unprivileged identity a worker runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl SandboxIdentity {
    /// Identity for the worker listening on `port`.
    ///
    /// Distinct ports map to distinct identities.
    pub fn for_port(port: u16, range_start: u16, uid_base: u32) -> Self {
        let id = uid_base + u32::from(port.saturating_sub(range_start));
        Self { uid: id, gid: id }
    }
}

/// Program, argv and environment of a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// The only environment the worker sees.
    pub env: Vec<(String, String)>,
}

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub instance: InstanceKey,
    pub kind: Kind,
    pub port: u16,
    pub workspace: PathBuf,
    pub command: WorkerCommand,
    /// `None` keeps the orchestrator's own identity.
    pub identity: Option<SandboxIdentity>,
}

/// Worker runtime interface.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Start a worker that keeps `lock` open for its whole life. Returns its pid.
    async fn spawn_worker(&self, spec: &WorkerSpec, lock: &File) -> Result<u32>;

    /// Send the worker a kill signal. Unknown pids are not an error.
    async fn kill_worker(&self, pid: u32) -> Result<()>;

    /// Wait for a killed worker to exit.
    async fn reap_worker(&self, pid: u32) -> Result<()>;

    /// One readiness check of the worker listening on `port`.
    async fn check_worker_health(&self, kind: Kind, port: u16) -> Result<bool>;
}

/// Mock runtime for testing.
///
/// A "worker" is a duplicate of the lock handle, so the readiness lock stays
/// held exactly as long as the mock worker lives.
pub struct MockRuntime {
    next_pid: AtomicU32,
    workers: Mutex<HashMap<u32, File>>,
    spawns: AtomicUsize,
    healthy: AtomicBool,
    fail_spawns: bool,
    spawn_delay: Duration,
    last_spec: Mutex<Option<WorkerSpec>>,
}

impl MockRuntime {
    /// Create a new mock runtime whose workers are healthy.
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(4000),
            workers: Mutex::new(HashMap::new()),
            spawns: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            fail_spawns: false,
            spawn_delay: Duration::ZERO,
            last_spec: Mutex::new(None),
        }
    }

    /// Create a mock runtime that fails all spawns.
    pub fn failing() -> Self {
        Self {
            fail_spawns: true,
            ..Self::new()
        }
    }

    /// Sleep this long inside every spawn.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    /// Make health checks pass or fail.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of successful spawns so far.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Returns true if the worker with `pid` is alive.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.lock_workers().contains_key(&pid)
    }

    /// Simulate the worker dying on its own.
    pub fn crash(&self, pid: u32) {
        self.lock_workers().remove(&pid);
    }

    /// Spec of the most recent spawn.
    pub fn last_spec(&self) -> Option<WorkerSpec> {
        self.last_spec
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<u32, File>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerRuntime for MockRuntime {
    async fn spawn_worker(&self, spec: &WorkerSpec, lock: &File) -> Result<u32> {
        if self.fail_spawns {
            return Err(Error::Spawn("mock runtime configured to fail".to_string()));
        }
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }

        let handle = lock.try_clone()?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.lock_workers().insert(pid, handle);
        self.spawns.fetch_add(1, Ordering::SeqCst);
        *self.last_spec.lock().unwrap_or_else(|e| e.into_inner()) = Some(spec.clone());

        info!(
            instance = %spec.instance,
            kind = %spec.kind,
            port = spec.port,
            pid,
            "[MOCK] Spawned worker"
        );
        Ok(pid)
    }

    async fn kill_worker(&self, pid: u32) -> Result<()> {
        debug!(pid, "[MOCK] Killing worker");
        self.lock_workers().remove(&pid);
        Ok(())
    }

    async fn reap_worker(&self, _pid: u32) -> Result<()> {
        Ok(())
    }

    async fn check_worker_health(&self, kind: Kind, port: u16) -> Result<bool> {
        debug!(%kind, port, "[MOCK] Checking worker health");
        Ok(!kind.is_node() || self.healthy.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_follow_ports() {
        let a = SandboxIdentity::for_port(1024, 1024, 30000);
        let b = SandboxIdentity::for_port(1025, 1024, 30000);
        assert_eq!(a, SandboxIdentity { uid: 30000, gid: 30000 });
        assert_eq!(b.uid, 30001);
    }

    #[tokio::test]
    async fn mock_worker_holds_lock_until_killed() {
        use fs2::FileExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let lock = File::create(&path).unwrap();
        lock.lock_exclusive().unwrap();

        let runtime = MockRuntime::new();
        let spec = WorkerSpec {
            instance: chainbox_id::InstanceKey::derive(
                &chainbox_id::IdentitySecret::new(b"k".to_vec()).unwrap(),
                "t",
                Kind::L1,
            ),
            kind: Kind::L1,
            port: 1024,
            workspace: dir.path().to_path_buf(),
            command: WorkerCommand {
                program: "anvil".into(),
                args: vec![],
                env: vec![],
            },
            identity: None,
        };
        let pid = runtime.spawn_worker(&spec, &lock).await.unwrap();
        drop(lock);

        let contender = File::open(&path).unwrap();
        assert!(contender.try_lock_exclusive().is_err());

        runtime.kill_worker(pid).await.unwrap();
        assert!(!runtime.is_alive(pid));
        assert!(contender.try_lock_exclusive().is_ok());
    }
}
