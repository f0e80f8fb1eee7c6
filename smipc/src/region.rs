//! Shared-region layout.
//!
//! One region per listening endpoint, mapped by every peer that talks to
//! it. All structures are `#[repr(C)]` with published field order so that
//! independently built processes agree on the layout:
//!
//! - a pool of 64 one-page copy buffers, each guarded by a raw spin lock,
//!   with a 64-bit availability bitmap
//! - 256 queue pairs (rx/tx rings named from the owner's perspective),
//!   with a 256-bit availability bitmap
//! - one command queue used by peers to announce queue-pair reservation
//!   and release to the region owner

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use smring::{bitmap_release, bitmap_reserve, CachelineAtomicU64, CachelineAtomicU64x4};
use smring::{RawSpinLock, Ring};

use crate::error::Result;
use crate::shm::SharedMemory;
use crate::{PAGE_SIZE, SHM_PREFIX};

/// Number of copy buffers (and message-ring slots) per region.
pub const NUM_BUFS: usize = 64;

/// Copy-buffer payload capacity, one page.
pub const COPY_BUF_SIZE: usize = PAGE_SIZE;

/// Number of queue pairs per region.
pub const MAX_PEERS: usize = 256;

/// Command-ring depth. Twice the pair count: RESERVED entries are never
/// drained by a polling owner (wire-up then arrives over the socket), so
/// the ring must absorb one entry per pair plus the releases.
pub const CMD_RING_DEPTH: usize = MAX_PEERS * 2;

/// Message ring: one slot per copy buffer.
pub type MsgRing = Ring<NUM_BUFS>;

/// Command ring.
pub type CmdRing = Ring<CMD_RING_DEPTH>;

/// Pool of payload staging buffers.
#[repr(C)]
pub struct CopyBufPool {
    locks: [RawSpinLock; NUM_BUFS],
    bufs: [UnsafeCell<[u8; COPY_BUF_SIZE]>; NUM_BUFS],
    available: CachelineAtomicU64,
}

// Buffer slots are exclusively owned between reserve and release, and the
// spin lock serializes the copy itself.
unsafe impl Sync for CopyBufPool {}

impl CopyBufPool {
    /// Reserve a free buffer slot. `None` means all 64 are taken.
    pub fn reserve(&self) -> Option<u32> {
        let index = bitmap_reserve(std::slice::from_ref(&self.available.val))?;
        tracing::debug!(index, "reserved copy buffer");
        Some(index)
    }

    /// Release buffer slot `index`.
    pub fn release(&self, index: u32) {
        bitmap_release(std::slice::from_ref(&self.available.val), index);
        tracing::debug!(index, "released copy buffer");
    }

    /// Copy `n` bytes from `src` into slot `index`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `n` reads, `n <= COPY_BUF_SIZE`, and the
    /// caller must hold the slot reservation.
    pub unsafe fn copy_to(&self, index: u32, src: *const u8, n: usize) {
        debug_assert!(n <= COPY_BUF_SIZE);
        let _guard = self.locks[index as usize].lock();
        std::ptr::copy_nonoverlapping(src, (*self.bufs[index as usize].get()).as_mut_ptr(), n);
    }

    /// Copy `n` bytes out of slot `index` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `n` writes and `n <= COPY_BUF_SIZE`.
    pub unsafe fn copy_from(&self, index: u32, dst: *mut u8, n: usize) {
        debug_assert!(n <= COPY_BUF_SIZE);
        let _guard = self.locks[index as usize].lock();
        std::ptr::copy_nonoverlapping((*self.bufs[index as usize].get()).as_ptr(), dst, n);
    }
}

/// One peer relationship: rx is where peers deposit messages for the
/// owner, tx is where the owner deposits replies.
#[repr(C)]
pub struct QueuePair {
    pub rx: MsgRing,
    pub tx: MsgRing,
}

#[repr(C, align(4096))]
struct QueuePairArray([QueuePair; MAX_PEERS]);

/// The full shared region.
#[repr(C)]
pub struct Region {
    pub copy_bufs: CopyBufPool,
    queue_pairs: QueuePairArray,
    pub cmd_queue: CmdRing,
    available: CachelineAtomicU64x4,
}

impl Region {
    /// Initialize a freshly created region in place: all buffers and all
    /// queue pairs available, all rings empty.
    ///
    /// # Safety
    ///
    /// `this` must point to zero-initialized writable memory of at least
    /// [`REGION_SIZE`] bytes, not yet visible to any peer.
    pub unsafe fn init(this: *mut Self) {
        use std::sync::atomic::Ordering;

        (*this)
            .copy_bufs
            .available
            .val
            .store(!0u64, Ordering::Relaxed);
        for word in &(*this).available.val {
            word.store(!0u64, Ordering::Relaxed);
        }
        for pair in (*this).queue_pairs.0.iter_mut() {
            MsgRing::init(&mut pair.rx);
            MsgRing::init(&mut pair.tx);
        }
        CmdRing::init(&mut (*this).cmd_queue);
    }

    /// Reserve a free queue pair. `None` means all 256 are taken.
    pub fn reserve_pair(&self) -> Option<u8> {
        let index = bitmap_reserve(&self.available.val)?;
        tracing::debug!(index, "reserved queue pair");
        Some(index as u8)
    }

    /// Release queue pair `index`.
    pub fn release_pair(&self, index: u8) {
        bitmap_release(&self.available.val, index as u32);
        tracing::debug!(index, "released queue pair");
    }

    pub fn queue_pair(&self, index: u8) -> &QueuePair {
        &self.queue_pairs.0[index as usize]
    }
}

/// Bytes mapped for one region, rounded up to whole pages.
pub const REGION_SIZE: usize =
    (std::mem::size_of::<Region>() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

const _: () = assert!(std::mem::size_of::<MsgRing>() == 128 + NUM_BUFS * 8);
const _: () = assert!(std::mem::size_of::<CmdRing>() == 128 + CMD_RING_DEPTH * 8);
const _: () = assert!(REGION_SIZE % PAGE_SIZE == 0);

/// SHM object name for endpoint (`username`, `pid`, `id`).
pub fn shm_name(username: &str, pid: i32, id: u8) -> String {
    format!("{}_{}-{}-{}", SHM_PREFIX, username, pid, id)
}

/// A mapped region, either freshly created (owner, unlinked on drop) or
/// attached to a peer's.
pub struct SharedRegion {
    shm: SharedMemory,
}

impl SharedRegion {
    pub fn create(username: &str, pid: i32, id: u8) -> Result<Self> {
        let name = shm_name(username, pid, id);
        tracing::debug!(%name, "creating shm region");
        let shm = unsafe { SharedMemory::create(&name, REGION_SIZE)? };
        unsafe { Region::init(shm.as_ptr() as *mut Region) };
        Ok(Self { shm })
    }

    pub fn open(username: &str, pid: i32, id: u8) -> Result<Self> {
        let name = shm_name(username, pid, id);
        tracing::debug!(%name, "opening shm region");
        let shm = unsafe { SharedMemory::open(&name, REGION_SIZE)? };
        Ok(Self { shm })
    }

    pub fn get(&self) -> &Region {
        unsafe { &*(self.shm.as_ptr() as *const Region) }
    }

    pub fn ptr(&self) -> NonNull<Region> {
        NonNull::new(self.shm.as_ptr() as *mut Region).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_layout_is_page_sized() {
        assert!(REGION_SIZE >= std::mem::size_of::<Region>());
        assert_eq!(REGION_SIZE % PAGE_SIZE, 0);
    }

    #[test]
    fn create_reserve_release_round_trip() {
        let region = SharedRegion::create("layouttest", std::process::id() as i32, 201).unwrap();
        let r = region.get();

        let mut pairs = Vec::new();
        for _ in 0..MAX_PEERS {
            pairs.push(r.reserve_pair().unwrap());
        }
        assert_eq!(r.reserve_pair(), None);
        for idx in pairs {
            r.release_pair(idx);
        }
        assert!(r.reserve_pair().is_some());
    }

    #[test]
    fn copy_buffers_round_trip() {
        let region = SharedRegion::create("layouttest", std::process::id() as i32, 202).unwrap();
        let pool = &region.get().copy_bufs;

        let idx = pool.reserve().unwrap();
        let src = [0xabu8; 128];
        let mut dst = [0u8; 128];
        unsafe {
            pool.copy_to(idx, src.as_ptr(), src.len());
            pool.copy_from(idx, dst.as_mut_ptr(), dst.len());
        }
        assert_eq!(src, dst);
        pool.release(idx);
    }

    #[test]
    fn peer_sees_owner_writes() {
        let pid = std::process::id() as i32;
        let owner = SharedRegion::create("layouttest", pid, 203).unwrap();
        let peer = SharedRegion::open("layouttest", pid, 203).unwrap();

        let idx = owner.get().reserve_pair().unwrap();
        assert!(peer.get().queue_pair(idx).rx.push(0xbeef));
        assert_eq!(owner.get().queue_pair(idx).rx.pop(), Some(0xbeef));
    }
}
