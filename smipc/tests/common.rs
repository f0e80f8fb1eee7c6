//! Common test utilities for smipc integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use smipc::{Addr, Completion, Endpoint, Error, OpId, Result};

/// Collects completions as they fire, from any thread.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Vec<Completion>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A one-shot callback that appends to this recorder.
    pub fn cb(&self) -> impl FnOnce(Completion) + Send + 'static {
        let inner = self.inner.clone();
        move |completion| inner.lock().unwrap().push(completion)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.inner.lock().unwrap().clone()
    }
}

/// Drive `ep` until `pred` holds or `deadline_ms` elapses.
pub fn progress_until(ep: &Endpoint, deadline_ms: u64, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return pred();
        }
        match ep.progress(20) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(e) => panic!("progress failed: {}", e),
        }
    }
}

/// The endpoint's own address in string form.
pub fn addr_string(ep: &Endpoint) -> String {
    let addr = ep.self_addr();
    let s = addr.to_string();
    ep.addr_free(&addr).unwrap();
    s
}

pub fn send_unexpected(
    ep: &Endpoint,
    op: &Arc<OpId>,
    payload: &[u8],
    dest: &Arc<Addr>,
    tag: u32,
    rec: &Recorder,
) -> Result<()> {
    unsafe { ep.msg_send_unexpected(op, payload.as_ptr(), payload.len(), dest, tag, rec.cb()) }
}

pub fn recv_unexpected(
    ep: &Endpoint,
    op: &Arc<OpId>,
    buf: &mut [u8],
    rec: &Recorder,
) -> Result<()> {
    unsafe { ep.msg_recv_unexpected(op, buf.as_mut_ptr(), buf.len(), rec.cb()) }
}

pub fn send_expected(
    ep: &Endpoint,
    op: &Arc<OpId>,
    payload: &[u8],
    dest: &Arc<Addr>,
    tag: u32,
    rec: &Recorder,
) -> Result<()> {
    unsafe { ep.msg_send_expected(op, payload.as_ptr(), payload.len(), dest, tag, rec.cb()) }
}

pub fn recv_expected(
    ep: &Endpoint,
    op: &Arc<OpId>,
    buf: &mut [u8],
    source: &Arc<Addr>,
    tag: u32,
    rec: &Recorder,
) -> Result<()> {
    unsafe { ep.msg_recv_expected(op, buf.as_mut_ptr(), buf.len(), source, tag, rec.cb()) }
}
