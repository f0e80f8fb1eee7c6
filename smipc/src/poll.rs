//! Thin epoll wrapper.
//!
//! Registers descriptors with a 64-bit token and waits for readability.
//! Tokens 0 and 1 are reserved for the control socket and the endpoint's
//! own tx-notify; addresses get tokens from a process-wide counter.

use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::Result;

/// Token identifying the endpoint's control socket.
pub const TOKEN_SOCK: u64 = 0;

/// Token identifying the endpoint's own tx-notify event.
pub const TOKEN_TX_NOTIFY: u64 = 1;

/// First token handed out to address rx-notify registrations.
pub const TOKEN_ADDR_BASE: u64 = 2;

/// Maximum events handled per wait.
pub const MAX_EVENTS: usize = 16;

pub struct PollSet {
    epoll: Epoll,
}

impl PollSet {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epoll })
    }

    pub fn register(&self, fd: BorrowedFd<'_>, token: u64) -> Result<()> {
        tracing::debug!(token, "registering fd for polling");
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token);
        self.epoll.add(fd, event)?;
        Ok(())
    }

    pub fn deregister(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Wait up to `timeout_ms` for events. Interruption reports zero
    /// events rather than an error.
    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: u32) -> Result<usize> {
        let timeout = EpollTimeout::from(u16::try_from(timeout_ms).unwrap_or(u16::MAX));
        match self.epoll.wait(events, timeout) {
            Ok(n) => Ok(n),
            Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
