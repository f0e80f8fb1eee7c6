//! Bounded multi-producer/multi-consumer ring of 64-bit words.
//!
//! The slot value zero is reserved to mean "empty": producers may only push
//! nonzero words, which lets consumers detect a claimed-but-not-yet-written
//! slot without auxiliary sequence numbers.
//!
//! Push claims a slot by CAS-advancing the producer head, writes the word,
//! then waits for earlier producers before publishing the producer tail.
//! Pop claims by CAS-advancing the consumer head, reads and zeroes the
//! slot, then waits for earlier consumers before advancing the consumer
//! tail. Heads and tails are free-running `u32`s; wrapping is handled by
//! the mask.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Producer or consumer half of the ring state, one cache line each.
#[repr(C, align(64))]
struct RingSide {
    head: AtomicU32,
    tail: AtomicU32,
    size: u32,
    mask: u32,
}

#[repr(C, align(64))]
struct Slots<const CAP: usize>([AtomicU64; CAP]);

/// A bounded MPMC ring holding `CAP` 64-bit words. `CAP` must be a power
/// of two. Valid when backed by zeroed shared memory once [`Ring::init`]
/// has run.
#[repr(C)]
pub struct Ring<const CAP: usize> {
    prod: RingSide,
    cons: RingSide,
    slots: Slots<CAP>,
}

impl<const CAP: usize> Ring<CAP> {
    /// Initialize ring state in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable, zero-initialized memory large enough
    /// for `Self`, and must not be shared with any other process or thread
    /// until `init` returns.
    pub unsafe fn init(this: *mut Self) {
        assert!(CAP.is_power_of_two(), "ring capacity must be a power of two");
        (*this).prod.size = CAP as u32;
        (*this).prod.mask = CAP as u32 - 1;
        (*this).cons.size = CAP as u32;
        (*this).cons.mask = CAP as u32 - 1;
    }

    /// Push a nonzero word. Returns `false` when the ring is full.
    pub fn push(&self, val: u64) -> bool {
        debug_assert!(val != 0, "zero is the empty-slot marker");

        let mut head;
        loop {
            head = self.prod.head.load(Ordering::Acquire);
            let tail = self.cons.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= self.prod.size {
                return false;
            }
            if self
                .prod
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        self.slots.0[(head & self.prod.mask) as usize].store(val, Ordering::Release);

        // Serialize publication with earlier producers.
        while self.prod.tail.load(Ordering::Acquire) != head {
            std::hint::spin_loop();
        }
        self.prod.tail.store(head.wrapping_add(1), Ordering::Release);

        true
    }

    /// Pop one word, or `None` when the ring is empty.
    pub fn pop(&self) -> Option<u64> {
        let mut head;
        loop {
            head = self.cons.head.load(Ordering::Acquire);
            let tail = self.prod.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            if self
                .cons
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        let slot = &self.slots.0[(head & self.cons.mask) as usize];
        let mut val = slot.load(Ordering::Acquire);
        while val == 0 {
            // Claimed but not yet written by its producer.
            std::hint::spin_loop();
            val = slot.load(Ordering::Acquire);
        }
        slot.store(0, Ordering::Release);

        // Serialize with earlier consumers.
        while self.cons.tail.load(Ordering::Acquire) != head {
            std::hint::spin_loop();
        }
        self.cons.tail.store(head.wrapping_add(1), Ordering::Release);

        Some(val)
    }

    /// Cheap emptiness probe, usable as a pre-poll check.
    pub fn is_empty(&self) -> bool {
        self.cons.head.load(Ordering::Acquire) == self.prod.tail.load(Ordering::Acquire)
    }
}
