//! Instance registry.
//!
//! Owns everything chainbox persists on disk:
//!
//! - one workspace per instance key at `<workdir>/<key>/`
//!   - `state.json`: string snapshot with at least `port` and `pid`
//!   - `chain-state.json`: node state seeded from a template
//!   - `status`: readiness lock and status text
//! - port lease records at `<workdir>/ports/`
//!
//! Only the registry and the supervisor write into these locations.

mod ports;
mod store;

use std::fs;
use std::io;
use std::ops::Range;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chainbox_id::{IdentitySecret, InstanceKey, Kind};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use ports::PortPool;
pub use store::{SnapshotFile, StateSnapshot};

/// Snapshot field holding the leased port.
pub const FIELD_PORT: &str = "port";
/// Snapshot field holding the worker pid, `0` when stopped.
pub const FIELD_PID: &str = "pid";

const PORTS_DIR: &str = "ports";
const WORKSPACE_MODE: u32 = 0o711;

/// Paths inside one instance workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> SnapshotFile {
        SnapshotFile::new(self.root.join("state.json"))
    }

    pub fn chain_state_path(&self) -> PathBuf {
        self.root.join("chain-state.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join("status")
    }

    /// Path of a named auxiliary lock file.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Identity derivation, workspaces, snapshots and port leases.
pub struct InstanceRegistry {
    workdir: PathBuf,
    secret: IdentitySecret,
    ports: PortPool,
    snapshots: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(workdir: impl Into<PathBuf>, secret: IdentitySecret, port_range: Range<u16>) -> Self {
        let workdir = workdir.into();
        let ports = PortPool::new(workdir.join(PORTS_DIR), port_range);
        Self {
            workdir,
            secret,
            ports,
            snapshots: Mutex::new(()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn port_range(&self) -> &Range<u16> {
        self.ports.range()
    }

    /// Stable instance key for `(token, kind)`.
    pub fn identity(&self, token: &str, kind: Kind) -> InstanceKey {
        InstanceKey::derive(&self.secret, token, kind)
    }

    /// Workspace paths for `id` without touching the filesystem.
    pub fn workspace(&self, id: &InstanceKey) -> Workspace {
        Workspace {
            root: self.workdir.join(id.as_str()),
        }
    }

    /// Create the workspace and an empty snapshot if they do not exist.
    pub fn ensure_workspace(&self, id: &InstanceKey) -> Result<Workspace> {
        let workspace = self.workspace(id);
        fs::create_dir_all(&self.workdir)?;
        match fs::create_dir(workspace.root()) {
            Ok(()) => {
                fs::set_permissions(workspace.root(), fs::Permissions::from_mode(WORKSPACE_MODE))?;
                debug!(instance = %id, path = %workspace.root().display(), "Created workspace");
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        workspace.snapshot().create_if_missing()?;
        Ok(workspace)
    }

    /// Lease a port for `owner` (sticky).
    pub async fn lease_port(&self, owner: &InstanceKey) -> Result<u16> {
        self.ports.lease(owner).await
    }

    /// Read a snapshot field. Reading `port` checks its lease.
    pub fn get(&self, id: &InstanceKey, field: &str) -> Result<Option<String>> {
        let value = self
            .workspace(id)
            .snapshot()
            .load()?
            .get(field)
            .map(str::to_string);

        if field == FIELD_PORT {
            if let Some(port) = &value {
                self.check_lease(id, parse_port(port)?)?;
            }
        }
        Ok(value)
    }

    /// Write a snapshot field.
    ///
    /// Setting `port` checks the lease of the new port; setting `pid` checks
    /// the lease of the recorded port.
    pub fn set(&self, id: &InstanceKey, field: &str, value: &str) -> Result<()> {
        let file = self.workspace(id).snapshot();
        let _guard = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshot = file.load()?;

        match field {
            FIELD_PORT => self.check_lease(id, parse_port(value)?)?,
            FIELD_PID => {
                if let Some(port) = snapshot.get(FIELD_PORT) {
                    self.check_lease(id, parse_port(port)?)?;
                }
            }
            _ => {}
        }

        snapshot.insert(field, value);
        file.save(&snapshot)?;
        Ok(())
    }

    /// Leased port recorded for `id`.
    pub fn port(&self, id: &InstanceKey) -> Result<Option<u16>> {
        self.get(id, FIELD_PORT)?
            .map(|p| parse_port(&p))
            .transpose()
    }

    pub fn set_port(&self, id: &InstanceKey, port: u16) -> Result<()> {
        self.set(id, FIELD_PORT, &port.to_string())
    }

    /// Recorded worker pid, `0` if none.
    pub fn pid(&self, id: &InstanceKey) -> Result<u32> {
        let snapshot = self.workspace(id).snapshot().load()?;
        match snapshot.get(FIELD_PID) {
            None => Ok(0),
            Some(pid) => pid.parse().map_err(|_| {
                Error::Storage(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("pid field of {id} is not a number: {pid}"),
                ))
            }),
        }
    }

    pub fn set_pid(&self, id: &InstanceKey, pid: u32) -> Result<()> {
        self.set(id, FIELD_PID, &pid.to_string())
    }

    /// Drop fields that only describe a previous worker.
    pub fn reset_transient(&self, id: &InstanceKey) -> Result<()> {
        let file = self.workspace(id).snapshot();
        let _guard = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshot = file.load()?;
        if snapshot.remove(FIELD_PID).is_some() {
            file.save(&snapshot)?;
        }
        Ok(())
    }

    /// Remove every workspace and lease record.
    ///
    /// Only directories named like an instance key are workspaces; anything
    /// else in the workdir is left alone.
    pub fn wipe(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.workdir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| InstanceKey::parse(n).ok()) else {
                continue;
            };
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                debug!(instance = %key, "Removed workspace");
                removed += 1;
            }
        }
        self.ports.clear()?;

        info!(workdir = %self.workdir.display(), removed, "Wiped workspaces");
        Ok(())
    }

    fn check_lease(&self, id: &InstanceKey, port: u16) -> Result<()> {
        let owner = self.ports.owner_of(port)?;
        if owner.as_deref() == Some(id.as_str()) {
            Ok(())
        } else {
            Err(Error::RegistryCorruption {
                instance: id.clone(),
                port,
                owner,
            })
        }
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("not a port: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> InstanceRegistry {
        let secret = IdentitySecret::new(b"registry-secret".to_vec()).unwrap();
        InstanceRegistry::new(dir.join("work"), secret, 41300..41360)
    }

    #[test]
    fn workspace_is_idempotent_and_restrictive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let id = registry.identity("alice", Kind::L1);

        let ws = registry.ensure_workspace(&id).unwrap();
        registry.set_pid(&id, 5).unwrap();
        registry.ensure_workspace(&id).unwrap();

        let mode = fs::metadata(ws.root()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o711);
        assert_eq!(registry.pid(&id).unwrap(), 5);
    }

    #[test]
    fn missing_pid_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let id = registry.identity("alice", Kind::L2);
        registry.ensure_workspace(&id).unwrap();
        assert_eq!(registry.pid(&id).unwrap(), 0);
        assert_eq!(registry.port(&id).unwrap(), None);
    }

    #[tokio::test]
    async fn port_requires_matching_lease() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let alice = registry.identity("alice", Kind::L1);
        let bob = registry.identity("bob", Kind::L1);
        registry.ensure_workspace(&alice).unwrap();
        registry.ensure_workspace(&bob).unwrap();

        let port = registry.lease_port(&alice).await.unwrap();
        registry.set_port(&alice, port).unwrap();
        assert_eq!(registry.port(&alice).unwrap(), Some(port));

        let err = registry.set_port(&bob, port).unwrap_err();
        assert!(matches!(err, Error::RegistryCorruption { .. }));
    }

    #[tokio::test]
    async fn corrupted_lease_is_detected_on_read_and_pid_write() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let alice = registry.identity("alice", Kind::L1);
        registry.ensure_workspace(&alice).unwrap();

        let port = registry.lease_port(&alice).await.unwrap();
        registry.set_port(&alice, port).unwrap();
        fs::write(
            registry.workdir().join(PORTS_DIR).join(format!("port_owner.{port}")),
            "inst_someone_else",
        )
        .unwrap();

        assert!(matches!(
            registry.port(&alice).unwrap_err(),
            Error::RegistryCorruption { .. }
        ));
        assert!(matches!(
            registry.set_pid(&alice, 1).unwrap_err(),
            Error::RegistryCorruption { .. }
        ));
    }

    #[test]
    fn reset_transient_clears_pid_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let id = registry.identity("alice", Kind::Relayer);
        registry.ensure_workspace(&id).unwrap();
        registry.set(&id, "note", "kept").unwrap();
        registry.set_pid(&id, 9).unwrap();

        registry.reset_transient(&id).unwrap();
        assert_eq!(registry.pid(&id).unwrap(), 0);
        assert_eq!(registry.get(&id, "note").unwrap().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn wipe_removes_workspaces_and_leases_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let id = registry.identity("alice", Kind::L1);
        let ws = registry.ensure_workspace(&id).unwrap();
        let port = registry.lease_port(&id).await.unwrap();

        let foreign = registry.workdir().join("operator-notes");
        fs::write(&foreign, "keep").unwrap();

        registry.wipe().unwrap();
        assert!(!ws.root().exists());
        assert!(foreign.exists());
        assert!(!registry
            .workdir()
            .join(PORTS_DIR)
            .join(format!("port_owner.{port}"))
            .exists());
        registry.wipe().unwrap();
    }
}
