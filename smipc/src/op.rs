//! Operation identifiers.
//!
//! An [`OpId`] is allocated once by the caller and reused: posting takes
//! it out of the COMPLETED state, fills in the per-submission context, and
//! completion (from the posting thread or the progress engine) hands the
//! result to the submission's callback and returns the identifier to
//! COMPLETED. The status word also carries the CANCELED and QUEUED bits
//! used by the cancellation protocol.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::addr::Addr;
use crate::error::Result;

/// Operation has completed; the identifier may be resubmitted.
pub(crate) const OP_COMPLETED: u32 = 1 << 0;
/// Cancellation was requested.
pub(crate) const OP_CANCELED: u32 = 1 << 1;
/// Operation is parked on one of the endpoint queues.
pub(crate) const OP_QUEUED: u32 = 1 << 2;

/// Operation kinds visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    SendUnexpected = 1,
    RecvUnexpected = 2,
    SendExpected = 3,
    RecvExpected = 4,
    Put = 5,
    Get = 6,
}

impl OpKind {
    /// Byte carried in message-ring headers for send kinds.
    pub(crate) fn msg_kind(self) -> u8 {
        self as u8
    }
}

/// Completion report delivered to the submission callback.
#[derive(Clone)]
pub struct Completion {
    pub kind: OpKind,
    pub result: Result<()>,
    /// Bytes actually received (receive kinds).
    pub actual_size: usize,
    /// Message tag (receive kinds).
    pub tag: u32,
    /// Sender address (receive-unexpected only); the callee owns one
    /// reference and releases it with `Endpoint::addr_free`.
    pub source: Option<Arc<Addr>>,
}

pub(crate) type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

/// Per-submission context, guarded by a mutex; the COMPLETED/QUEUED
/// protocol keeps contention to the handoff points.
pub(crate) struct OpInner {
    pub kind: OpKind,
    pub callback: Option<CompletionCallback>,
    /// Caller buffer (send: read `buf_size` bytes; receive: write up to
    /// `buf_size` bytes).
    pub buf: *mut u8,
    pub buf_size: usize,
    pub actual_size: usize,
    pub tag: u32,
    pub addr: Option<Arc<Addr>>,
}

// The raw buffer pointer is only used while the submission contract keeps
// the caller's buffer alive.
unsafe impl Send for OpInner {}

/// Reusable operation identifier.
pub struct OpId {
    pub(crate) status: AtomicU32,
    pub(crate) inner: Mutex<OpInner>,
}

impl OpId {
    /// Allocate an identifier, ready for its first submission.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU32::new(OP_COMPLETED),
            inner: Mutex::new(OpInner {
                kind: OpKind::SendUnexpected,
                callback: None,
                buf: std::ptr::null_mut(),
                buf_size: 0,
                actual_size: 0,
                tag: 0,
                addr: None,
            }),
        })
    }

    /// Whether the last submission has completed.
    pub fn is_completed(&self) -> bool {
        self.status.load(Ordering::Acquire) & OP_COMPLETED != 0
    }

    pub(crate) fn has_status(&self, bit: u32) -> bool {
        self.status.load(Ordering::Acquire) & bit != 0
    }
}
