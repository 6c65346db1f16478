//! Advisory file locks.
//!
//! The readiness lock is an exclusive `flock` on a workspace's `status` file.
//! A worker inherits the locked handle, so the lock is held exactly while the
//! worker lives. The file's text is `READY\n` once the startup handshake has
//! completed.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

/// Status text of a worker that completed its handshake.
pub const READY_MARKER: &str = "READY\n";

/// Outcome of a non-blocking attempt on the readiness lock.
#[derive(Debug)]
pub enum LockAttempt {
    /// Nobody held the lock; the caller now does.
    Acquired(ReadinessLock),
    /// A live worker (or a start in progress) holds the lock.
    Held { ready: bool },
}

/// Held readiness lock of one workspace.
#[derive(Debug)]
pub struct ReadinessLock {
    file: File,
}

impl ReadinessLock {
    /// Try to take the lock at `path` without blocking.
    pub fn try_acquire(path: &Path) -> io::Result<LockAttempt> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockAttempt::Acquired(Self { file })),
            Err(e) if is_contended(&e) => Ok(LockAttempt::Held {
                ready: read_status(&file)?,
            }),
            Err(e) => Err(e),
        }
    }

    /// Handle passed on to the worker.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Forget any status left by a previous worker.
    pub fn clear_status(&self) -> io::Result<()> {
        self.file.set_len(0)
    }

    /// Record that the handshake completed.
    pub fn mark_ready(&self) -> io::Result<()> {
        (&self.file).write_all(READY_MARKER.as_bytes())?;
        (&self.file).flush()
    }

    /// Returns true if the status text says ready.
    pub fn is_ready(&self) -> io::Result<bool> {
        read_status(&self.file)
    }
}

/// Take a plain exclusive lock on `path` without blocking.
///
/// `None` if somebody else holds it. The lock is released when the returned
/// handle is dropped.
pub fn try_lock_file(path: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_status(mut file: &File) -> io::Result<bool> {
    file.seek(SeekFrom::Start(0))?;
    let mut status = String::new();
    file.take(READY_MARKER.len() as u64)
        .read_to_string(&mut status)?;
    Ok(status == READY_MARKER)
}
