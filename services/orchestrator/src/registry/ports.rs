//! Port leases.
//!
//! One record per port at `<dir>/port_owner.<port>`, containing the owner's
//! instance key. A record is never rewritten once created, so the owner of a
//! port keeps it for as long as the record exists.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;
use std::path::{Path, PathBuf};

use chainbox_id::InstanceKey;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

const RECORD_PREFIX: &str = "port_owner.";

/// Shared pool of listening ports.
pub struct PortPool {
    dir: PathBuf,
    range: Range<u16>,
    lease_lock: Mutex<()>,
}

impl PortPool {
    pub fn new(dir: PathBuf, range: Range<u16>) -> Self {
        Self {
            dir,
            range,
            lease_lock: Mutex::new(()),
        }
    }

    pub fn range(&self) -> &Range<u16> {
        &self.range
    }

    fn record_path(&self, port: u16) -> PathBuf {
        self.dir.join(format!("{RECORD_PREFIX}{port}"))
    }

    /// Owner recorded for `port`, if any.
    pub fn owner_of(&self, port: u16) -> io::Result<Option<String>> {
        match fs::read_to_string(self.record_path(port)) {
            Ok(owner) => Ok(Some(owner)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Lease a port for `owner`.
    ///
    /// Returns the port already recorded for `owner` if there is one.
    /// Otherwise takes the lowest unowned port in range that is bindable on
    /// loopback.
    pub async fn lease(&self, owner: &InstanceKey) -> Result<u16> {
        let _guard = self.lease_lock.lock().await;
        fs::create_dir_all(&self.dir)?;

        if let Some(port) = self.find_existing(owner)? {
            debug!(instance = %owner, port, "Reusing port lease");
            return Ok(port);
        }

        for port in self.range.clone() {
            if self.record_path(port).exists() || !is_bindable(port) {
                continue;
            }
            match self.create_record(port, owner) {
                Ok(()) => {
                    info!(instance = %owner, port, "Leased port");
                    return Ok(port);
                }
                // another process recorded it between the check and the create
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::PortExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    fn find_existing(&self, owner: &InstanceKey) -> io::Result<Option<u16>> {
        let mut found = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(port) = name
                .to_str()
                .and_then(|n| n.strip_prefix(RECORD_PREFIX))
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            if self.owner_of(port)?.as_deref() == Some(owner.as_str()) {
                found = Some(found.map_or(port, |p: u16| p.min(port)));
            }
        }
        Ok(found)
    }

    fn create_record(&self, port: u16, owner: &InstanceKey) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.record_path(port))?;
        file.write_all(owner.as_str().as_bytes())?;
        file.sync_all()
    }

    /// Remove every lease record.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
