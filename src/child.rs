//! Child activator: fork/exec with the listen fd moved to a
//! well-known slot and credentials dropped, grounded on the fork/dup2/setsid
//! sequence in the original `service_activate()` and on this codebase's
//! `services/start_service.rs` for the nix-crate idioms.

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Gid, Pid, Uid};

use crate::error::Error;
use crate::service::Service;

/// The fd slot every activated child finds its listener on.
pub const ACTIVATION_FD: RawFd = 3;

/// Preconditions: `executable != none ∧ pid == none ∧ listen_fd != none`.
/// On success the parent has recorded the child's pid and `service.listen_fd`
/// is `None` (ownership moved to the child); the caller is responsible for
/// having already unregistered the fd from the reactor before calling this.
pub fn activate(service: &mut Service) -> Result<(), Error> {
    let exec = service
        .executable
        .as_ref()
        .expect("activate() requires a managed service")
        .clone();
    assert!(service.pid.is_none(), "service already has a running child");
    let listen_fd = service
        .listen_fd
        .take()
        .expect("activate() requires a held listener");

    let argv = service.argv();
    let listen_raw_fd = listen_fd.as_raw_fd();

    // SAFETY: the child performs only async-signal-safe work (dup2, prctl,
    // chdir, setsid, setresuid/gid, execve) between fork and exec/_exit.
    match unsafe { nix::unistd::fork() }.map_err(|e| Error::Spawn(format!("fork for {}", service.address), e))? {
        ForkResult::Parent { child } => {
            // Keep the fd alive in the parent until after fork so the
            // child's dup2 target is guaranteed valid; then let it drop.
            drop(listen_fd);
            service.pid = Some(child);
            Ok(())
        }
        ForkResult::Child => {
            std::process::exit(run_child(&exec.path, &argv, listen_raw_fd, exec.uid, exec.gid));
        }
    }
}

/// Runs entirely in the forked child. Never returns: either `execve`
/// succeeds (replacing the process image) or this exits with the errno of
/// whichever setup step failed, matching the original's `_exit(errno)`.
fn run_child(executable: &std::path::Path, argv: &[String], listen_fd: RawFd, uid: u32, gid: u32) -> i32 {
    if let Err(e) = nix::unistd::dup2(listen_fd, ACTIVATION_FD) {
        return e as i32;
    }

    if let Err(e) = nix::sys::prctl::set_pdeathsig(Some(Signal::SIGTERM)) {
        return e as i32;
    }

    if executable.is_absolute() {
        if let Err(e) = nix::unistd::chdir("/") {
            return e as i32;
        }
    }

    if let Err(e) = nix::unistd::setsid() {
        return e as i32;
    }

    if gid > 0 {
        let gid = Gid::from_raw(gid);
        if let Err(e) = nix::unistd::setresgid(gid, gid, gid) {
            return e as i32;
        }
    }

    if uid > 0 {
        let uid = Uid::from_raw(uid);
        if let Err(e) = nix::unistd::setresuid(uid, uid, uid) {
            return e as i32;
        }
    }

    let pid = std::process::id();
    // SAFETY: we are single-threaded post-fork, immediately before execve.
    unsafe {
        std::env::set_var("LISTEN_PID", pid.to_string());
        std::env::set_var("LISTEN_FDS", "1");
    }

    let Ok(path) = CString::new(executable.as_os_str().to_string_lossy().into_owned()) else {
        return libc::EINVAL;
    };
    let Ok(args): Result<Vec<CString>, _> = argv.iter().map(|a| CString::new(a.as_str())).collect() else {
        return libc::EINVAL;
    };

    match nix::unistd::execv(&path, &args) {
        Ok(_) => unreachable!("execv only returns on error"),
        Err(e) => e as i32,
    }
}

/// Translates a reaped child's wait status into the exit classification
/// logged when a service crashes.
pub fn describe_exit(status: nix::sys::wait::WaitStatus) -> (bool, String) {
    use nix::sys::wait::WaitStatus::*;
    match status {
        Exited(_, 0) => (true, "exited with status 0".to_owned()),
        Exited(_, code) => (false, format!("exited with status {code}")),
        Signaled(_, sig, core) => (
            false,
            if core {
                format!("killed by signal {sig} (core dumped)")
            } else {
                format!("killed by signal {sig}")
            },
        ),
        other => (false, format!("unexpected wait status: {other:?}")),
    }
}

pub fn pid_of(status: &nix::sys::wait::WaitStatus) -> Option<Pid> {
    status.pid()
}
