//! Per-queue wake notifiers.
//!
//! Each direction of a queue pair gets an eventfd in semaphore mode: the
//! producer side writes one count per deposited message, the consumer side
//! reads counts off while draining its ring. Descriptors cross process
//! boundaries as `SCM_RIGHTS` ancillary data, so a notifier is either one
//! we created or one adopted from the peer; both are owned (and closed)
//! locally, the origin decides which side the semantics of tx/rx map to.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use crate::error::Result;

/// Where a notifier descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierOrigin {
    /// Created by this endpoint (`eventfd(2)`).
    Local,
    /// Received from the peer over the control socket.
    Peer,
}

/// A semaphore-style edge signal between two processes.
#[derive(Debug)]
pub struct Notifier {
    fd: OwnedFd,
    origin: NotifierOrigin,
}

impl Notifier {
    /// Create a new non-blocking semaphore eventfd.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            let raw = libc::eventfd(
                0,
                libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE | libc::EFD_CLOEXEC,
            );
            if raw < 0 {
                return Err(Errno::last().into());
            }
            OwnedFd::from_raw_fd(raw)
        };
        tracing::debug!(fd = fd.as_raw_fd(), "created event");
        Ok(Self {
            fd,
            origin: NotifierOrigin::Local,
        })
    }

    /// Adopt a descriptor received from the peer.
    pub fn from_peer(fd: OwnedFd) -> Self {
        tracing::debug!(fd = fd.as_raw_fd(), "adopted peer event");
        Self {
            fd,
            origin: NotifierOrigin::Peer,
        }
    }

    pub fn origin(&self) -> NotifierOrigin {
        self.origin
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    /// Post one count to the peer.
    pub fn signal(&self) -> Result<()> {
        let count: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &count as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc != std::mem::size_of::<u64>() as isize {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// Consume one count. Returns `false` when no signal was pending.
    pub fn drain(&self) -> Result<bool> {
        let mut count: u64 = 0;
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc == std::mem::size_of::<u64>() as isize {
            return Ok(true);
        }
        let errno = Errno::last();
        if errno == Errno::EAGAIN {
            Ok(false)
        } else {
            Err(errno.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain() {
        let ev = Notifier::new().unwrap();
        assert!(!ev.drain().unwrap());

        ev.signal().unwrap();
        ev.signal().unwrap();

        // Semaphore mode: one count per drain.
        assert!(ev.drain().unwrap());
        assert!(ev.drain().unwrap());
        assert!(!ev.drain().unwrap());
    }

    #[test]
    fn adopted_fd_shares_counts() {
        let ev = Notifier::new().unwrap();
        let dup = ev.fd.try_clone().unwrap();
        let peer = Notifier::from_peer(dup);
        assert_eq!(peer.origin(), NotifierOrigin::Peer);

        ev.signal().unwrap();
        assert!(peer.drain().unwrap());
        assert!(!peer.drain().unwrap());
    }
}
