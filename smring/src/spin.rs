//! Raw spin lock for shared mappings.
//!
//! A single `AtomicU32` word, valid when zero-initialized, so it can guard
//! per-slot state inside a region mapped by several processes where a
//! `std::sync::Mutex` cannot live. Critical sections are expected to be a
//! single `memcpy`; there is no queueing or backoff beyond the cpu hint.

use std::sync::atomic::{AtomicU32, Ordering};

#[repr(C)]
pub struct RawSpinLock {
    state: AtomicU32,
}

/// Guard that releases the lock on drop.
pub struct SpinGuard<'a> {
    lock: &'a RawSpinLock,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { lock: self };
            }
            while self.state.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

const _: () = assert!(std::mem::size_of::<RawSpinLock>() == 4);
