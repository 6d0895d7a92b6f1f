//! Per-service state: the record that threads through
//! construction, activation, crash/reset, and destruction.

use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::Error;
use crate::ipc;

/// Where to find and how to invoke a managed service's executable.
#[derive(Debug, Clone)]
pub struct Executable {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug)]
pub struct Service {
    pub address: String,
    pub interfaces: Vec<String>,
    pub executable: Option<Executable>,
    pub config_path: Option<String>,
    pub activate_at_startup: bool,

    /// Held while Dormant, `None` while Running or Failed.
    pub listen_fd: Option<OwnedFd>,
    pub path_to_unlink: Option<PathBuf>,

    pub pid: Option<Pid>,
    pub failed: bool,

    /// Back-pointer into the supervisor's dense vector; kept valid across
    /// `swap_remove` by the supervisor. Doubles as the `epoll` user-data
    /// token for this service's listener.
    pub index: usize,
}

impl Service {
    /// Construction fails if listener creation fails: an unmanaged service
    /// never owns a listener or a child; a managed, non-failed, dormant
    /// service always does.
    pub fn new(
        address: String,
        interfaces: Vec<String>,
        executable: Option<Executable>,
        config_path: Option<String>,
        activate_at_startup: bool,
    ) -> Result<Self, Error> {
        if interfaces.is_empty() {
            return Err(Error::InvalidSpec("a service must claim at least one interface".to_owned()));
        }
        if interfaces.iter().any(|i| i.is_empty()) {
            return Err(Error::InvalidSpec("interface names must be non-empty".to_owned()));
        }

        let (listen_fd, path_to_unlink) = if executable.is_some() {
            let listener = ipc::create_listener(&address)?;
            (Some(listener.fd), listener.path_to_unlink)
        } else {
            (None, None)
        };

        Ok(Service {
            address,
            interfaces,
            executable,
            config_path,
            activate_at_startup,
            listen_fd,
            path_to_unlink,
            pid: None,
            failed: false,
            index: 0,
        })
    }

    /// Derived `[executable, address, config_path?]`.
    pub fn argv(&self) -> Vec<String> {
        let Some(exec) = &self.executable else {
            return Vec::new();
        };
        let mut argv = vec![exec.path.to_string_lossy().into_owned(), self.address.clone()];
        if let Some(config) = &self.config_path {
            argv.push(config.clone());
        }
        argv
    }

    pub fn listen_raw_fd(&self) -> Option<RawFd> {
        self.listen_fd.as_ref().map(|fd| std::os::fd::AsRawFd::as_raw_fd(fd))
    }

    /// Post-crash rebind: close the old fd, unlink the old path,
    /// bind fresh. The only legal transition from Failed back to Dormant.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.release_listener();
        let listener = ipc::create_listener(&self.address)?;
        self.listen_fd = Some(listener.fd);
        self.path_to_unlink = listener.path_to_unlink;
        Ok(())
    }

    fn release_listener(&mut self) {
        self.listen_fd = None;
        if let Some(path) = self.path_to_unlink.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to unlink {}: {e}", path.display());
                }
            }
        }
    }
}

impl Drop for Service {
    /// Destruction: SIGTERM the child if running, close the listener,
    /// unlink the socket path.
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                log::debug!("SIGTERM to {pid} ({}) failed: {e}", self.address);
            }
        }
        self.release_listener();
    }
}
