//! Control channel: one Unix datagram socket per endpoint.
//!
//! Datagrams carry one 8-byte command header, plus two event descriptors
//! as `SCM_RIGHTS` ancillary data when a peer wires up a queue pair.
//! Listeners bind under `/tmp/<prefix>_<user>/<pid>/<ordinal>/sock`;
//! non-listeners keep the socket unbound and only send.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    bind, recvmsg, sendmsg, socket, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};

use crate::error::{Error, Result};
use crate::{SHM_PREFIX, TMP_DIR};

/// Name of the socket file inside the per-endpoint directory.
const SOCK_NAME: &str = "sock";

/// Per-user root of the control-socket tree.
pub fn user_dir(username: &str) -> PathBuf {
    PathBuf::from(format!("{}/{}_{}", TMP_DIR, SHM_PREFIX, username))
}

/// Directory holding one endpoint's socket.
pub fn sock_dir(username: &str, pid: i32, id: u8) -> PathBuf {
    user_dir(username).join(pid.to_string()).join(id.to_string())
}

/// Full socket path for an endpoint.
pub fn sock_path(username: &str, pid: i32, id: u8) -> PathBuf {
    sock_dir(username, pid, id).join(SOCK_NAME)
}

pub struct ControlSock {
    fd: OwnedFd,
    bound_path: Option<PathBuf>,
}

impl ControlSock {
    /// Open the endpoint's control socket; `create` binds it at the
    /// canonical path (building the directory chain on demand).
    pub fn open(username: &str, pid: i32, id: u8, create: bool) -> Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;

        let mut bound_path = None;
        if create {
            let dir = sock_dir(username, pid, id);
            std::fs::create_dir_all(&dir).map_err(Error::from)?;

            let path = dir.join(SOCK_NAME);
            tracing::debug!(path = %path.display(), "binding control socket");
            let addr = UnixAddr::new(&path)?;
            if let Err(e) = bind(fd.as_raw_fd(), &addr) {
                remove_sock_tree(&path);
                return Err(e.into());
            }
            bound_path = Some(path);
        }

        Ok(Self { fd, bound_path })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Send a command to the endpoint at (`pid`, `id`), optionally passing
    /// the {tx-notify, rx-notify} descriptor pair.
    ///
    /// `EAGAIN` and `ETOOMANYREFS` (the kernel's pending-fd-pass flood
    /// control) map to [`Error::Again`]. With `ignore_error`, failures are
    /// silenced: release commands are best-effort cleanup.
    pub fn send_cmd(
        &self,
        username: &str,
        pid: i32,
        id: u8,
        cmd: u64,
        fds: Option<(BorrowedFd<'_>, BorrowedFd<'_>)>,
        ignore_error: bool,
    ) -> Result<()> {
        let path = sock_path(username, pid, id);
        let addr = UnixAddr::new(&path)?;

        let bytes = cmd.to_le_bytes();
        let iov = [IoSlice::new(&bytes)];

        let raw_fds;
        let cmsg_storage;
        let cmsgs: &[ControlMessage<'_>] = if let Some((tx, rx)) = &fds {
            raw_fds = [tx.as_raw_fd(), rx.as_raw_fd()];
            cmsg_storage = [ControlMessage::ScmRights(&raw_fds)];
            &cmsg_storage
        } else {
            &[]
        };

        match sendmsg(
            self.fd.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::empty(),
            Some(&addr),
        ) {
            Ok(_) => Ok(()),
            Err(_) if ignore_error => Ok(()),
            Err(Errno::EAGAIN) | Err(Errno::ETOOMANYREFS) => Err(Error::Again),
            Err(e) => Err(e.into()),
        }
    }

    /// Receive one command, if any is pending.
    ///
    /// Returns the command word plus the adopted descriptor pair when the
    /// sender attached one. Descriptors received here are new entries in
    /// this process's table and must be counted by the caller.
    pub fn recv_cmd(&self) -> Result<Option<(u64, Option<(OwnedFd, OwnedFd)>)>> {
        let mut buf = [0u8; 8];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buffer = cmsg_space!([std::os::fd::RawFd; 2]);

        let received = match recvmsg::<UnixAddr>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().map_err(Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        for raw in received {
                            // SCM_RIGHTS descriptors are already installed
                            // in our table; take ownership immediately so
                            // nothing leaks on malformed datagrams.
                            fds.push(unsafe {
                                <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(raw)
                            });
                        }
                    }
                }
                (msg.bytes, fds)
            }
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (nbytes, mut fds) = received;
        if nbytes != buf.len() {
            // Runt datagram: drop it (and any descriptors it smuggled in).
            tracing::debug!(nbytes, "dropping malformed control datagram");
            return Ok(None);
        }

        let cmd = u64::from_le_bytes(buf);
        let pair = if fds.len() == 2 {
            let rx = fds.pop().unwrap();
            let tx = fds.pop().unwrap();
            Some((tx, rx))
        } else {
            // Zero is normal (release commands); anything else is garbage.
            if !fds.is_empty() {
                tracing::debug!(count = fds.len(), "dropping unexpected descriptor set");
            }
            None
        };

        Ok(Some((cmd, pair)))
    }

    /// Close the socket, removing its path and directory chain when bound.
    pub fn close(mut self) -> Result<()> {
        self.close_impl();
        Ok(())
    }

    fn close_impl(&mut self) {
        if let Some(path) = self.bound_path.take() {
            remove_sock_tree(&path);
        }
    }
}

impl Drop for ControlSock {
    fn drop(&mut self) {
        self.close_impl();
    }
}

/// Unlink the socket file and prune now-empty directories up to (and
/// including) the per-user root. Errors are ignored: siblings keep their
/// directories alive.
fn remove_sock_tree(path: &Path) {
    let _ = std::fs::remove_file(path);
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == Path::new(TMP_DIR) || std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}
