//! Error types shared across the supervisor, reactor, and RPC surface.
//!
//! This follows the rest of this codebase's house style: plain enums with a
//! hand-written `Display`, rather than a derive-macro error crate.

use std::fmt;

/// Failures that can occur while constructing or rebinding a service's
/// listener, or while driving the reactor/signal plumbing around it.
#[derive(Debug)]
pub enum Error {
    /// Bind/listen on a service's or the control address failed.
    ListenerFailed { address: String, source: std::io::Error },
    /// Two services tried to claim the same interface name.
    NotUnique(String),
    /// An `epoll_ctl`/`epoll_wait`/`epoll_create1` call failed. Fatal: the
    /// reactor's registration set can no longer be trusted.
    Reactor(nix::Error),
    /// Signal mask setup or `signalfd` creation failed. Fatal at startup.
    Signals(nix::Error),
    /// `fork`/`execve`/credential-drop setup failed for a child.
    Spawn(String, nix::Error),
    /// The startup configuration file is malformed or oversized.
    Config(String),
    /// A service definition is structurally invalid (no claimed interfaces,
    /// a blank interface name, ...).
    InvalidSpec(String),
    /// Generic I/O failure (fd duplication, unlink, etc).
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenerFailed { address, source } => {
                write!(f, "failed to bind listener on {address}: {source}")
            }
            Self::NotUnique(name) => write!(f, "interface claimed by more than one service: {name}"),
            Self::Reactor(e) => write!(f, "reactor error: {e}"),
            Self::Signals(e) => write!(f, "signal channel error: {e}"),
            Self::Spawn(what, e) => write!(f, "{what}: {e}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidSpec(msg) => write!(f, "invalid service definition: {msg}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ListenerFailed { source, .. } => Some(source),
            Self::Reactor(e) | Self::Signals(e) | Self::Spawn(_, e) => Some(e),
            Self::Io(e) => Some(e),
            Self::NotUnique(_) | Self::Config(_) | Self::InvalidSpec(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Reactor(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors the admin RPC surface can reply with. These map onto the
/// varlink error names exposed by the resolver/activator interfaces
/// (`org.varlink.resolver.InterfaceNotFound`, etc).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    InvalidParameter(String),
    InterfaceNotFound,
    NotUnique(String),
    ListenerFailed(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter(field) => write!(f, "invalid parameter: {field}"),
            Self::InterfaceNotFound => write!(f, "interface not found"),
            Self::NotUnique(name) => write!(f, "interface not unique: {name}"),
            Self::ListenerFailed(msg) => write!(f, "listener failed: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// The varlink error name this reply carries, as named by the
    /// `org.varlink.resolver`/`org.varlink.activator` interfaces.
    pub fn varlink_name(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "org.varlink.service.InvalidParameter",
            Self::InterfaceNotFound => "org.varlink.resolver.InterfaceNotFound",
            Self::NotUnique(_) => "org.varlink.activator.NotUnique",
            Self::ListenerFailed(_) => "org.varlink.activator.ListenerFailed",
        }
    }
}
