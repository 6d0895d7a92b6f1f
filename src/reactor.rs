//! Single-threaded readiness multiplexer: one `epoll` instance
//! holding the control listener, the signal channel, and every managed
//! service's listen fd, tagged by a `Token` the caller hands back on each
//! ready event.
//!
//! Grounded on the `epoll_create1`/`epoll_ctl`/`epoll_wait` loop in
//! `examples/original_source/src/main.c`'s `main()`; the nix-crate surface
//! mirrors `nix::sys::epoll` as used elsewhere in this codebase's
//! socket-activation helpers.

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::os::fd::{AsFd, BorrowedFd, RawFd};

use crate::error::Error;

/// What a ready event refers to. The control socket and signal channel are
/// singletons; every other registration is a service's listen fd, tagged by
/// its stable slot in the supervisor's service vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Control,
    Signals,
    Service(usize),
}

impl Token {
    fn encode(self) -> u64 {
        match self {
            Token::Control => 0,
            Token::Signals => 1,
            Token::Service(slot) => slot as u64 + 2,
        }
    }

    fn decode(raw: u64) -> Self {
        match raw {
            0 => Token::Control,
            1 => Token::Signals,
            slot => Token::Service((slot - 2) as usize),
        }
    }
}

pub struct Reactor {
    epoll: Epoll,
}

impl Reactor {
    pub fn new() -> Result<Self, Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::Reactor)?;
        Ok(Reactor { epoll })
    }

    pub fn register(&self, fd: BorrowedFd<'_>, token: Token) -> Result<(), Error> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token.encode());
        self.epoll.add(fd, event).map_err(Error::Reactor)
    }

    pub fn unregister(&self, fd: BorrowedFd<'_>) -> Result<(), Error> {
        self.epoll.delete(fd).map_err(Error::Reactor)
    }

    /// Wait for exactly one ready registration and return its token. `timeout`
    /// is `None` for an infinite wait (the normal case) or `Some(1000)` when
    /// at least one service is in the Failed state, matching the original's `epoll_wait(..., timeout)` argument.
    pub fn wait_one(&self, timeout_ms: Option<u16>) -> Result<Option<Token>, Error> {
        let mut events = [EpollEvent::empty(); 1];
        let timeout = match timeout_ms {
            Some(ms) => EpollTimeout::try_from(ms).unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };

        let n = loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(n) => break n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(Error::Reactor(e)),
            }
        };

        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Token::decode(events[0].data())))
    }
}

pub fn fd_of(raw: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(raw) }
}

pub fn as_fd<T: AsFd>(owner: &T) -> BorrowedFd<'_> {
    owner.as_fd()
}
