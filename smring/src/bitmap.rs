//! Word-scan bitmap allocators.
//!
//! A set bit means the slot is free. Reservation scans word by word and
//! claims a bit with a compare-and-swap; release is a single atomic OR.
//! Contention between reservers is resolved without a lock: a failed CAS
//! re-reads the word, and a word observed empty advances the scan. A stale
//! read cannot double-allocate because the exchange requires both the
//! observed value and the candidate bit still being set.

use std::sync::atomic::{AtomicU64, Ordering};

/// Reserve one free bit from `words`, clearing it.
///
/// Returns the global bit index (`word * 64 + bit`), or `None` when no bit
/// could be claimed (the caller maps this to its try-again error).
pub fn bitmap_reserve(words: &[AtomicU64]) -> Option<u32> {
    for (w, word) in words.iter().enumerate() {
        let mut i = 0u32;
        let mut bits = 1u64;

        while i < 64 {
            let available = word.load(Ordering::Acquire);
            if available == 0 {
                // Word exhausted, move on to the next one.
                break;
            }
            if available & bits != bits {
                // Already reserved by someone else.
                i += 1;
                bits <<= 1;
                continue;
            }
            if word
                .compare_exchange(
                    available,
                    available & !bits,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(w as u32 * 64 + i);
            }
            // CAS raced with another reserver. The next iteration re-reads
            // the word; if our candidate bit got taken, the freshness check
            // above advances to the next one.
        }
    }

    None
}

/// Release bit `index` back into `words`. Never fails, never blocks.
pub fn bitmap_release(words: &[AtomicU64], index: u32) {
    let w = (index / 64) as usize;
    let bit = 1u64 << (index % 64);
    words[w].fetch_or(bit, Ordering::AcqRel);
}
