//! Signal channel: SIGCHLD/SIGTERM/SIGINT delivered through a
//! `signalfd` so the reactor can multiplex them alongside listen fds,
//! mirroring the original's `signalfd(2)` use. The drain loop and exit
//! classification are grounded on `libsystemd/src/signal_handler.rs`'s
//! `get_next_exited_child`/`ChildTermination` in this codebase, adapted from
//! its threaded `waitpid`-in-a-loop form to a single synchronous drain.

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::Error;

pub struct SignalChannel {
    fd: SignalFd,
}

impl SignalChannel {
    /// Blocks SIGCHLD/SIGTERM/SIGINT on the current thread and opens a
    /// `signalfd` to receive them, mirroring `main()` in the original.
    pub fn new() -> Result<Self, Error> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.thread_block().map_err(Error::Signals)?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(Error::Signals)?;

        Ok(SignalChannel { fd })
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.fd)
    }

    /// One `signalfd` read yields one packed `(signo, pid, code, status)`
    /// record. SIGCHLD classification is delegated to `drain_children`
    /// by the caller; here we only decide which signal fired.
    pub fn read_signal(&mut self) -> Result<Option<Signal>, Error> {
        match self.fd.read_signal() {
            Ok(Some(info)) => Ok(Signal::try_from(info.ssi_signo as i32).ok()),
            Ok(None) => Ok(None),
            Err(nix::Error::EAGAIN) => Ok(None),
            Err(e) => Err(Error::Signals(e)),
        }
    }
}

/// Drain every terminated child with non-blocking `waitpid(-1, WNOHANG)`,
/// stopping when none remain (`ECHILD` or `StillAlive`).
pub fn drain_exited_children(mut on_exit: impl FnMut(Pid, WaitStatus)) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    on_exit(pid, status);
                }
            }
            Err(nix::Error::ECHILD) => break,
            Err(nix::Error::EINTR) => continue,
            Err(e) => {
                log::error!("waitpid failed: {e}");
                break;
            }
        }
    }
}

/// Installs this process as a child subreaper so grandchildren from a
/// double-fork are reaped here instead of accumulating as zombies.
pub fn become_subreaper() -> Result<(), Error> {
    nix::sys::prctl::set_child_subreaper(true).map_err(Error::Signals)
}
