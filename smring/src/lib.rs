//! Lock-free primitives designed to live inside a shared-memory mapping.
//!
//! Everything here is `#[repr(C)]`, contains no pointers, and is valid when
//! backed by zero-initialized pages, so the structures can be placed
//! directly into a region mapped by multiple processes:
//!
//! - [`bitmap`]: word-scan CAS bitmap allocators for slot reservation
//! - [`ring`]: bounded multi-producer/multi-consumer ring of 64-bit words
//! - [`spin`]: a raw single-word spin lock
//!
//! Cache-line padded atomic wrappers are provided so hot producer/consumer
//! state does not false-share with neighbouring fields.

pub mod bitmap;
pub mod ring;
pub mod spin;

pub use bitmap::{bitmap_release, bitmap_reserve};
pub use ring::Ring;
pub use spin::RawSpinLock;

use std::sync::atomic::AtomicU64;

/// Cache line size assumed for padding.
pub const CACHE_LINE_SIZE: usize = 64;

/// A single `AtomicU64` padded out to one cache line.
#[repr(C, align(64))]
pub struct CachelineAtomicU64 {
    pub val: AtomicU64,
}

/// Four `AtomicU64` words (a 256-bit bitmap) padded to one cache line.
#[repr(C, align(64))]
pub struct CachelineAtomicU64x4 {
    pub val: [AtomicU64; 4],
}

const _: () = assert!(std::mem::size_of::<CachelineAtomicU64>() == CACHE_LINE_SIZE);
const _: () = assert!(std::mem::size_of::<CachelineAtomicU64x4>() == CACHE_LINE_SIZE);
