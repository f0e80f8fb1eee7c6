//! Error types for smipc.

use std::fmt;
use std::io;

use nix::errno::Errno;

/// Error type for smipc operations, mapped from the kernel error namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation not permitted (e.g. cross-memory attach denied).
    Permission,
    /// No such file or directory / unknown address.
    NoEntry,
    /// Interrupted system call.
    Interrupted,
    /// Transient back-pressure; retry later.
    Again,
    /// Out of memory.
    NoMem,
    /// Access denied.
    Access,
    /// Invalid argument.
    InvalidArg,
    /// Bad address.
    Fault,
    /// Resource busy (e.g. endpoint close with work outstanding).
    Busy,
    /// Already exists.
    Exist,
    /// No such device (e.g. SHM region could not be mapped).
    NoDev,
    /// String or size overflow.
    Overflow,
    /// Message size mismatch (short cross-process transfer).
    MsgSize,
    /// Protocol not supported.
    ProtoNoSupport,
    /// Operation not supported on this platform.
    OpNotSupported,
    /// Address already in use.
    AddrInUse,
    /// Address not available.
    AddrNotAvail,
    /// Timeout elapsed without progress.
    Timeout,
    /// Operation canceled.
    Canceled,
    /// Generic protocol error.
    Protocol,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Permission => write!(f, "operation not permitted"),
            Error::NoEntry => write!(f, "no such entry"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::Again => write!(f, "resource temporarily unavailable"),
            Error::NoMem => write!(f, "out of memory"),
            Error::Access => write!(f, "access denied"),
            Error::InvalidArg => write!(f, "invalid argument"),
            Error::Fault => write!(f, "bad address"),
            Error::Busy => write!(f, "resource busy"),
            Error::Exist => write!(f, "already exists"),
            Error::NoDev => write!(f, "no such device"),
            Error::Overflow => write!(f, "value too large"),
            Error::MsgSize => write!(f, "message size mismatch"),
            Error::ProtoNoSupport => write!(f, "protocol not supported"),
            Error::OpNotSupported => write!(f, "operation not supported"),
            Error::AddrInUse => write!(f, "address already in use"),
            Error::AddrNotAvail => write!(f, "address not available"),
            Error::Timeout => write!(f, "timeout"),
            Error::Canceled => write!(f, "canceled"),
            Error::Protocol => write!(f, "protocol error"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EPERM => Error::Permission,
            Errno::ENOENT => Error::NoEntry,
            Errno::EINTR => Error::Interrupted,
            Errno::EAGAIN => Error::Again,
            Errno::ENOMEM => Error::NoMem,
            Errno::EACCES => Error::Access,
            Errno::EINVAL => Error::InvalidArg,
            Errno::EFAULT => Error::Fault,
            Errno::EBUSY => Error::Busy,
            Errno::EEXIST => Error::Exist,
            Errno::ENODEV => Error::NoDev,
            Errno::EOVERFLOW | Errno::ENAMETOOLONG => Error::Overflow,
            Errno::EMSGSIZE => Error::MsgSize,
            Errno::EPROTONOSUPPORT => Error::ProtoNoSupport,
            Errno::EOPNOTSUPP => Error::OpNotSupported,
            Errno::EADDRINUSE => Error::AddrInUse,
            Errno::EADDRNOTAVAIL => Error::AddrNotAvail,
            Errno::ETIMEDOUT => Error::Timeout,
            Errno::ECANCELED => Error::Canceled,
            _ => Error::Protocol,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Errno::from_raw(code).into(),
            None => Error::Protocol,
        }
    }
}

/// Result type for smipc operations.
pub type Result<T> = std::result::Result<T, Error>;
