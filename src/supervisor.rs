//! The manager: owns the service table, the interface index, the
//! control listener, the signal channel, and the reactor, and runs the event
//! loop that ties C1-C5 together. Grounded on `struct manager` and `main()`
//! in `examples/original_source/src/main.c`.

use std::os::fd::AsFd;
use std::os::unix::net::UnixListener;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::child;
use crate::config::ServiceSpec;
use crate::error::{Error, RpcError};
use crate::index::InterfaceIndex;
use crate::ipc;
use crate::reactor::{Reactor, Token};
use crate::service::Service;
use crate::signals::{self, SignalChannel};

/// Global crash backoff: a service that just failed is not retried until
/// this much time has passed, and the reactor wait timeout is capped at the
/// same value while any service is Failed.
const BACKOFF: Duration = Duration::from_millis(1000);

pub struct Manager {
    services: Vec<Service>,
    index: InterfaceIndex,
    reactor: Reactor,
    control: UnixListener,
    control_path: Option<std::path::PathBuf>,
    signals: SignalChannel,
    shutting_down: bool,
    last_failure: Option<Instant>,
}

impl Manager {
    pub fn new(control_address: &str) -> Result<Self, Error> {
        let reactor = Reactor::new()?;

        // Inbound socket activation: a pre-bound listener on fd 3 is adopted
        // in place of binding `control_address` ourselves.
        let (control, control_path) = if let Some(fd) = ipc::adopt_activation_fd() {
            log::info!("adopting pre-bound listener on fd 3");
            (ipc::listener_from_raw_fd(fd), None)
        } else {
            let listener = ipc::create_listener(control_address)?;
            (ipc::listener_from_raw_fd(ipc::into_raw_fd(listener.fd)), listener.path_to_unlink)
        };
        reactor.register(control.as_fd(), Token::Control)?;

        signals::become_subreaper()?;
        let signals = SignalChannel::new()?;
        reactor.register(crate::reactor::fd_of(signals.as_raw_fd()), Token::Signals)?;

        Ok(Manager {
            services: Vec::new(),
            index: InterfaceIndex::default(),
            reactor,
            control,
            control_path,
            signals,
            shutting_down: false,
            last_failure: None,
        })
    }

    pub fn control_listener(&self) -> &UnixListener {
        &self.control
    }

    /// Add or replace a single service by address, rebuilding the interface
    /// index immediately. `add_services` is the batch entry point and does
    /// not go through this: it defers the rebuild until every entry in the
    /// batch has been registered.
    pub fn add_service(&mut self, spec: ServiceSpec) -> Result<(), Error> {
        self.insert_or_replace(spec)?;
        self.index.rebuild(&self.services)
    }

    /// Register every entry in `specs`, then rebuild the interface index
    /// once. Each entry is added (or replaces an existing address)
    /// unconditionally; a uniqueness collision across the whole resulting
    /// table is only detected at the trailing rebuild, so one colliding
    /// entry cannot keep a later, otherwise-valid entry from being added.
    pub fn add_services(&mut self, specs: Vec<ServiceSpec>) -> Result<(), Error> {
        for spec in specs {
            self.insert_or_replace(spec)?;
        }
        self.index.rebuild(&self.services)
    }

    fn insert_or_replace(&mut self, spec: ServiceSpec) -> Result<(), Error> {
        let service = Service::new(
            spec.address.clone(),
            spec.interfaces,
            spec.into_executable(),
            spec.config_path,
            spec.activate_at_startup,
        )?;

        if let Some(existing) = self.services.iter().position(|s| s.address == service.address) {
            self.remove_at(existing)?;
        }

        self.register_new(service)
    }

    fn register_new(&mut self, mut service: Service) -> Result<(), Error> {
        let slot = self.services.len();
        service.index = slot;
        if let Some(fd) = service.listen_fd.as_ref() {
            self.reactor.register(fd.as_fd(), Token::Service(slot))?;
        }
        self.services.push(service);
        Ok(())
    }

    /// `swap_remove` keeps the vector dense; the displaced last element's
    /// `index` and reactor registration (if any) are fixed up in place. A
    /// generational arena was considered and rejected since mutation only
    /// ever happens on this single thread between `epoll_wait` calls, so a
    /// stale index can never be observed concurrently.
    fn remove_at(&mut self, slot: usize) -> Result<(), Error> {
        if let Some(fd) = self.services[slot].listen_fd.as_ref() {
            self.reactor.unregister(fd.as_fd())?;
        }
        let last = self.services.len() - 1;
        self.services.swap_remove(slot);
        if slot != last {
            if let Some(fd) = self.services[slot].listen_fd.as_ref() {
                self.reactor.unregister(fd.as_fd())?;
                self.reactor.register(fd.as_fd(), Token::Service(slot))?;
            }
            self.services[slot].index = slot;
        }
        Ok(())
    }

    pub fn resolve(&self, interface: &str) -> Result<&Service, RpcError> {
        let slot = self.index.find(interface).ok_or(RpcError::InterfaceNotFound)?;
        Ok(&self.services[slot])
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.index.names()
    }

    /// Activate every service whose config requested it, in table order, at
    /// startup. Failures are logged and do not stop the remaining
    /// services from being considered, mirroring the original's best-effort
    /// startup pass.
    pub fn activate_configured_services(&mut self) {
        let slots: Vec<usize> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, s)| s.activate_at_startup && !s.failed && s.pid.is_none())
            .map(|(i, _)| i)
            .collect();
        for slot in slots {
            if let Err(e) = self.activate_slot(slot) {
                log::error!("startup activation of {} failed: {e}", self.services[slot].address);
            }
        }
    }

    fn activate_slot(&mut self, slot: usize) -> Result<(), Error> {
        if self.services[slot].executable.is_none() {
            return Ok(());
        }
        if let Some(fd) = self.services[slot].listen_fd.as_ref() {
            self.reactor.unregister(fd.as_fd())?;
        }
        child::activate(&mut self.services[slot])
    }

    /// Drains the signal channel and runs one `epoll_wait` dispatch. Returns
    /// `false` once SIGTERM/SIGINT has requested shutdown and there is
    /// nothing left to dispatch.
    pub fn step(&mut self) -> Result<bool, Error> {
        if self.shutting_down {
            return Ok(false);
        }

        let timeout_ms = if self.services.iter().any(|s| s.failed) {
            Some(1000u16)
        } else {
            None
        };

        match self.reactor.wait_one(timeout_ms)? {
            Some(Token::Control) => {
                let control = &self.control;
                let mut pending: Option<(String, serde_json::Value, ipc::Call)> = None;
                ipc::accept_and_dispatch(control, |call| {
                    pending = Some((call.method.clone(), call.parameters.clone(), call));
                    Ok(())
                })
                .map_err(Error::Io)?;
                if let Some((method, parameters, call)) = pending {
                    crate::rpc::dispatch(self, &method, parameters, call);
                }
            }
            Some(Token::Signals) => self.handle_signal()?,
            Some(Token::Service(slot)) => {
                // A client dialed the service's own address directly; this
                // is the on-demand activation trigger.
                if let Err(e) = self.activate_slot(slot) {
                    log::error!("activation of {} failed: {e}", self.services[slot].address);
                }
            }
            None => self.retry_failed_services(),
        }

        Ok(!self.shutting_down)
    }

    fn handle_signal(&mut self) -> Result<(), Error> {
        let Some(signal) = self.signals.read_signal()? else {
            return Ok(());
        };
        match signal {
            Signal::SIGTERM | Signal::SIGINT => {
                log::info!("received {signal}, shutting down");
                self.shutting_down = true;
            }
            Signal::SIGCHLD => {
                let mut exited = Vec::new();
                signals::drain_exited_children(|pid, status| exited.push((pid, status)));
                for (pid, status) in exited {
                    self.handle_child_exit(pid, status);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Clean exit always rebinds the listener defensively even though the
    /// only path that should produce one is an explicit deactivation this
    /// codebase doesn't expose yet; a crash rebinds,
    /// marks the service Failed, and arms the global backoff timeout.
    fn handle_child_exit(&mut self, pid: Pid, status: WaitStatus) {
        let Some(slot) = self.services.iter().position(|s| s.pid == Some(pid)) else {
            return;
        };
        self.services[slot].pid = None;

        let (clean, description) = child::describe_exit(status);
        if !clean {
            log::warn!("service {} crashed: {description}", self.services[slot].address);
            self.services[slot].failed = true;
            self.last_failure = Some(Instant::now());
        }

        if let Err(e) = self.services[slot].reset() {
            log::error!("failed to rebind listener for {}: {e}", self.services[slot].address);
            return;
        }
        if let Some(fd) = self.services[slot].listen_fd.as_ref() {
            if let Err(e) = self.reactor.register(fd.as_fd(), Token::Service(slot)) {
                log::error!("failed to re-register listener for {}: {e}", self.services[slot].address);
            }
        }
    }

    /// Called when `epoll_wait` times out: clears the Failed flag on any
    /// service whose backoff has elapsed, making it eligible for activation
    /// again.
    fn retry_failed_services(&mut self) {
        let Some(last) = self.last_failure else { return };
        if last.elapsed() < BACKOFF {
            return;
        }
        for service in &mut self.services {
            service.failed = false;
        }
        self.last_failure = None;
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(path) = self.control_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
