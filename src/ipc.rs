//! Minimal stand-in for an external IPC framing library: listener creation
//! plus the varlink wire framing (a JSON object per message, NUL-terminated)
//! on top of `UnixListener`/`UnixStream`.
//!
//! Real varlink client libraries keep a connection open across many calls.
//! This stand-in treats each accepted connection as a single request/reply
//! round (the admin surface here is request/reply only, no `more` streaming),
//! which keeps the reactor integration in `reactor.rs`/`supervisor.rs` a
//! one-fd-one-event affair.

use std::io::{Read, Write};
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, RpcError};

/// A bound, listening address plus the filesystem path to unlink on
/// cleanup.
pub struct Listener {
    pub fd: OwnedFd,
    pub path_to_unlink: Option<PathBuf>,
}

/// Parse a `unix:<path>` address into the socket path. Only the `unix:`
/// scheme is supported.
pub fn parse_unix_address(address: &str) -> Result<&Path, Error> {
    address
        .strip_prefix("unix:")
        .map(Path::new)
        .ok_or_else(|| Error::Config(format!("unsupported address scheme: {address}")))
}

/// Bind a fresh listening socket for `address`. If a stale socket file is
/// left over from a previous run, it is unlinked first.
pub fn create_listener(address: &str) -> Result<Listener, Error> {
    let path = parse_unix_address(address)?;

    if path.exists() {
        std::fs::remove_file(path).map_err(|source| Error::ListenerFailed {
            address: address.to_owned(),
            source,
        })?;
    }

    let listener = UnixListener::bind(path).map_err(|source| Error::ListenerFailed {
        address: address.to_owned(),
        source,
    })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| Error::ListenerFailed { address: address.to_owned(), source })?;

    Ok(Listener {
        fd: listener.into(),
        path_to_unlink: Some(path.to_path_buf()),
    })
}

/// Read-probe fd 3: the activation protocol detects a pre-bound listener by
/// a zero-length read succeeding on it.
pub fn adopt_activation_fd() -> Option<RawFd> {
    const ACTIVATION_FD: RawFd = 3;
    let mut buf = [0u8; 0];
    match nix::unistd::read(unsafe { std::os::fd::BorrowedFd::borrow_raw(ACTIVATION_FD) }, &mut buf) {
        Ok(0) => Some(ACTIVATION_FD),
        _ => None,
    }
}

/// One decoded request, still holding the connection it arrived on so a
/// reply can be written back.
pub struct Call {
    stream: UnixStream,
    pub method: String,
    pub parameters: Value,
}

impl Call {
    pub fn reply(self, parameters: Value) -> std::io::Result<()> {
        self.write_message(&serde_json::json!({ "parameters": parameters }))
    }

    pub fn reply_error(self, error: &RpcError) -> std::io::Result<()> {
        let parameters = match error {
            RpcError::InvalidParameter(field) => serde_json::json!({ "parameter": field }),
            RpcError::NotUnique(name) => serde_json::json!({ "interface": name }),
            RpcError::ListenerFailed(msg) => serde_json::json!({ "reason": msg }),
            RpcError::InterfaceNotFound => Value::Object(Default::default()),
        };
        self.write_message(&serde_json::json!({
            "error": error.varlink_name(),
            "parameters": parameters,
        }))
    }

    fn write_message(mut self, msg: &Value) -> std::io::Result<()> {
        let mut bytes = serde_json::to_vec(msg)?;
        bytes.push(0);
        self.stream.write_all(&bytes)
    }
}

/// Accept one connection on `listener`, drain every NUL-terminated message
/// pipelined on it, and hand each to `handler`. The connection is given a
/// short read timeout so a slow or silent client cannot wedge the reactor
/// thread, which otherwise services this synchronously.
pub fn accept_and_dispatch(
    listener: &UnixListener,
    mut handler: impl FnMut(Call) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let (mut stream, _addr) = listener.accept()?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(pos) = buf.iter().position(|b| *b == 0) {
            let message = buf.drain(..=pos).collect::<Vec<u8>>();
            let message = &message[..message.len() - 1];
            let value: Value = match serde_json::from_slice(message) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("malformed request on control socket: {e}");
                    continue;
                }
            };
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let parameters = value.get("parameters").cloned().unwrap_or(Value::Null);
            let call_stream = stream.try_clone()?;
            handler(Call { stream: call_stream, method, parameters })?;
        }

        match stream.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn listener_from_raw_fd(fd: RawFd) -> UnixListener {
    let owned: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(fd) };
    UnixListener::from(owned)
}

pub fn into_raw_fd(fd: OwnedFd) -> RawFd {
    fd.into_raw_fd()
}
