//! Linux process confinement.
//!
//! Everything here runs either in the forked child before `exec` (and must
//! stay async-signal-safe) or wraps a single syscall.

use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{geteuid, Pid};

use super::SandboxIdentity;

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
const NICE_INCREMENT: libc::c_int = 10;

/// Returns true when running with root privileges.
pub fn is_root() -> bool {
    geteuid().is_root()
}

/// Give `path` to the sandbox identity so the worker can write it.
pub fn hand_over(path: &Path, identity: SandboxIdentity) -> io::Result<()> {
    std::os::unix::fs::chown(path, Some(identity.uid), Some(identity.gid))
}

/// Install the pre-exec confinement sequence on `cmd`.
///
/// In the child: new session, optional privilege drop, every descriptor
/// above stdio except `keep_fd` marked close-on-exec, parent-death signal,
/// lower priority.
pub fn confine(cmd: &mut Command, keep_fd: RawFd, identity: Option<SandboxIdentity>) {
    let parent = std::process::id() as libc::pid_t;

    // SAFETY: the closure only issues async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }

            if let Some(id) = identity {
                if libc::setgroups(0, std::ptr::null()) != 0 {
                    return Err(io::Error::last_os_error());
                }
                // gid first, it cannot change after dropping root
                if libc::setresgid(id.gid, id.gid, id.gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::setresuid(id.uid, id.uid, id.uid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            cloexec_except(keep_fd)?;

            // set after the credential change, which clears it
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::getppid() != parent {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }

            // -1 is a valid niceness, so the result says nothing
            libc::nice(NICE_INCREMENT);
            Ok(())
        });
    }
}

unsafe fn cloexec_except(keep: RawFd) -> io::Result<()> {
    let keep = keep as libc::c_uint;
    if keep > 3 {
        close_range_cloexec(3, keep - 1)?;
    }
    close_range_cloexec(keep + 1, libc::c_uint::MAX)?;

    let flags = libc::fcntl(keep as libc::c_int, libc::F_GETFD);
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if libc::fcntl(keep as libc::c_int, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

unsafe fn close_range_cloexec(first: libc::c_uint, last: libc::c_uint) -> io::Result<()> {
    if libc::syscall(libc::SYS_close_range, first, last, CLOSE_RANGE_CLOEXEC) == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOSYS) {
        return Err(err);
    }

    // kernels before 5.11
    let open_max = libc::sysconf(libc::_SC_OPEN_MAX);
    let open_max = if open_max > 0 { open_max as libc::c_uint } else { 1024 };
    let mut fd = first;
    while fd <= last && fd < open_max {
        let flags = libc::fcntl(fd as libc::c_int, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd as libc::c_int, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
        fd += 1;
    }
    Ok(())
}

/// Send SIGKILL to `pid`. A vanished process is not an error.
pub fn kill_process(pid: u32) -> Result<(), Errno> {
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Block until `pid` exits. A process that is not our child is not an error.
pub fn reap_process(pid: u32) -> Result<(), Errno> {
    match waitpid(Pid::from_raw(pid as i32), None) {
        Ok(_) | Err(Errno::ECHILD) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[test]
    fn killing_a_missing_process_is_ok() {
        // pid_max is at most 2^22
        assert!(kill_process(4_194_304 + 7).is_ok());
    }

    #[test]
    fn confined_child_runs_in_own_session() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "exit 0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let keep = tempfile::tempfile().unwrap();
        confine(&mut cmd, std::os::fd::AsRawFd::as_raw_fd(&keep), None);

        let child = cmd.spawn().unwrap();
        let pid = child.id();
        drop(child);
        assert!(reap_process(pid).is_ok());
        // second reap sees ECHILD
        assert!(reap_process(pid).is_ok());
    }
}
