//! Memory handles and the RMA transfer path.
//!
//! A [`MemHandle`] is a scatter/gather descriptor over the registering
//! process's address space: up to eight segments inline, heap beyond.
//! Handles travel between peers in serialized form; the addresses inside
//! are only meaningful to the process that registered them, which is
//! exactly what the kernel's cross-process copy primitive consumes.
//!
//! Transfers translate an (offset, length) window on each side into a
//! fresh iov list and issue one `process_vm_writev`/`process_vm_readv`.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Segments held inline before spilling to the heap.
pub const IOV_STATIC_MAX: usize = 8;

bitflags! {
    /// Access rights granted by a registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// One contiguous piece of registered memory, in the registering
/// process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub len: u64,
}

type SegVec = SmallVec<[Segment; IOV_STATIC_MAX]>;

/// Scatter/gather memory registration.
pub struct MemHandle {
    segments: SegVec,
    len: u64,
    flags: MemAccess,
}

impl MemHandle {
    /// Register a single contiguous buffer.
    pub fn new(buf: *const u8, len: usize, flags: MemAccess) -> Self {
        let mut segments = SegVec::new();
        segments.push(Segment {
            base: buf as u64,
            len: len as u64,
        });
        Self {
            segments,
            len: len as u64,
            flags,
        }
    }

    /// Register a segment list.
    pub fn from_segments(segments: &[Segment], flags: MemAccess) -> Result<Self> {
        if segments.is_empty() {
            return Err(Error::InvalidArg);
        }
        let len = segments.iter().map(|s| s.len).sum();
        Ok(Self {
            segments: SegVec::from_slice(segments),
            len,
            flags,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total registered length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flags(&self) -> MemAccess {
        self.flags
    }

    /// Bytes needed by [`MemHandle::serialize`].
    pub fn serialized_size(&self) -> usize {
        8 + 8 + 1 + self.segments.len() * 16
    }

    /// Serialize: descriptor info (segment count, total length, flags)
    /// followed by (base, length) pairs, little-endian. Addresses remain
    /// in the registering process's address space.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.serialized_size();
        if buf.len() < need {
            return Err(Error::Overflow);
        }
        buf[0..8].copy_from_slice(&(self.segments.len() as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&self.len.to_le_bytes());
        buf[16] = self.flags.bits();
        let mut off = 17;
        for seg in &self.segments {
            buf[off..off + 8].copy_from_slice(&seg.base.to_le_bytes());
            buf[off + 8..off + 16].copy_from_slice(&seg.len.to_le_bytes());
            off += 16;
        }
        Ok(need)
    }

    /// Deserialize a handle produced by [`MemHandle::serialize`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 17 {
            return Err(Error::Overflow);
        }
        let iovcnt = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        let len = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let flags = MemAccess::from_bits(buf[16]).ok_or(Error::InvalidArg)?;
        if buf.len() < 17 + iovcnt * 16 {
            return Err(Error::Overflow);
        }

        let mut segments = SegVec::with_capacity(iovcnt);
        let mut off = 17;
        for _ in 0..iovcnt {
            segments.push(Segment {
                base: u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()),
                len: u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap()),
            });
            off += 16;
        }
        if segments.is_empty() {
            return Err(Error::InvalidArg);
        }
        Ok(Self {
            segments,
            len,
            flags,
        })
    }
}

/// Locate the segment covering `offset`: (start index, offset within it).
pub(crate) fn iov_index_offset(segments: &[Segment], offset: u64) -> (usize, u64) {
    let mut remaining = offset;
    let mut next_offset = 0u64;
    for (i, seg) in segments.iter().enumerate() {
        next_offset += seg.len;
        if offset < next_offset {
            return (i, remaining);
        }
        remaining -= seg.len;
    }
    (segments.len().saturating_sub(1), remaining)
}

/// Materialize the iov list for a `len`-byte window starting at
/// (`start`, `start_offset`): the first entry is offset-adjusted and
/// clipped, later entries are clipped to the remaining length.
pub(crate) fn iov_translate(
    segments: &[Segment],
    start: usize,
    start_offset: u64,
    len: u64,
) -> SegVec {
    let mut out = SegVec::new();
    let first_len = (segments[start].len - start_offset).min(len);
    out.push(Segment {
        base: segments[start].base + start_offset,
        len: first_len,
    });

    let mut remaining = len - first_len;
    for seg in &segments[start + 1..] {
        if remaining == 0 {
            break;
        }
        let l = remaining.min(seg.len);
        out.push(Segment { base: seg.base, len: l });
        remaining -= l;
    }
    out
}

/// Translate an (offset, length) window over a handle's segment list.
/// A window covering the whole registration passes through untouched.
pub(crate) fn translate_window(handle: &MemHandle, offset: u64, len: u64) -> Result<SegVec> {
    let end = offset.checked_add(len).ok_or(Error::InvalidArg)?;
    if end > handle.len() {
        return Err(Error::InvalidArg);
    }
    if offset == 0 && len == handle.len() {
        return Ok(SegVec::from_slice(handle.segments()));
    }
    let (start, start_offset) = iov_index_offset(handle.segments(), offset);
    Ok(iov_translate(handle.segments(), start, start_offset, len))
}

#[cfg(target_os = "linux")]
fn ptrace_scope_restricted() -> bool {
    std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope")
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .map(|v| v > 0)
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn map_cma_error(e: nix::errno::Errno) -> Error {
    if e == nix::errno::Errno::EPERM && ptrace_scope_restricted() {
        tracing::warn!(
            "cross-memory attach denied: kernel.yama.ptrace_scope restricts \
             ptrace; relax it or have the target call \
             prctl(PR_SET_PTRACER, PR_SET_PTRACER_ANY)"
        );
        Error::Permission
    } else {
        e.into()
    }
}

/// Write `local` into `remote` within process `pid`.
///
/// # Safety
///
/// Every local segment must be valid readable memory for its full length.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn vm_write(pid: i32, local: &[Segment], remote: &[Segment]) -> Result<usize> {
    use nix::sys::uio::{process_vm_writev, RemoteIoVec};

    let liov: Vec<std::io::IoSlice<'_>> = local
        .iter()
        .map(|s| {
            std::io::IoSlice::new(std::slice::from_raw_parts(
                s.base as *const u8,
                s.len as usize,
            ))
        })
        .collect();
    let riov: Vec<RemoteIoVec> = remote
        .iter()
        .map(|s| RemoteIoVec {
            base: s.base as usize,
            len: s.len as usize,
        })
        .collect();

    process_vm_writev(nix::unistd::Pid::from_raw(pid), &liov, &riov).map_err(map_cma_error)
}

/// Read `remote` from process `pid` into `local`.
///
/// # Safety
///
/// Every local segment must be valid writable memory for its full length.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn vm_read(pid: i32, local: &[Segment], remote: &[Segment]) -> Result<usize> {
    use nix::sys::uio::{process_vm_readv, RemoteIoVec};

    let mut liov: Vec<std::io::IoSliceMut<'_>> = local
        .iter()
        .map(|s| {
            std::io::IoSliceMut::new(std::slice::from_raw_parts_mut(
                s.base as *mut u8,
                s.len as usize,
            ))
        })
        .collect();
    let riov: Vec<RemoteIoVec> = remote
        .iter()
        .map(|s| RemoteIoVec {
            base: s.base as usize,
            len: s.len as usize,
        })
        .collect();

    process_vm_readv(nix::unistd::Pid::from_raw(pid), &mut liov, &riov).map_err(map_cma_error)
}

/// No cross-process copy primitive on this platform.
#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn vm_write(_pid: i32, _local: &[Segment], _remote: &[Segment]) -> Result<usize> {
    Err(Error::OpNotSupported)
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn vm_read(_pid: i32, _local: &[Segment], _remote: &[Segment]) -> Result<usize> {
    Err(Error::OpNotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_by_1000() -> Vec<Segment> {
        vec![
            Segment {
                base: 0x10_0000,
                len: 1000,
            },
            Segment {
                base: 0x20_0000,
                len: 1000,
            },
            Segment {
                base: 0x30_0000,
                len: 1000,
            },
        ]
    }

    #[test]
    fn index_offset_walk() {
        let segs = three_by_1000();
        assert_eq!(iov_index_offset(&segs, 0), (0, 0));
        assert_eq!(iov_index_offset(&segs, 500), (0, 500));
        assert_eq!(iov_index_offset(&segs, 1000), (1, 0));
        assert_eq!(iov_index_offset(&segs, 2999), (2, 999));
    }

    #[test]
    fn translate_offset_window_spanning_segments() {
        // Skip 500 bytes of segment 1, take 2000: 500 + 1000 + 500.
        let local = MemHandle::from_segments(&three_by_1000(), MemAccess::READ).unwrap();
        let iov = translate_window(&local, 500, 2000).unwrap();
        assert_eq!(iov.len(), 3);
        assert_eq!(iov[0], Segment { base: 0x10_0000 + 500, len: 500 });
        assert_eq!(iov[1], Segment { base: 0x20_0000, len: 1000 });
        assert_eq!(iov[2], Segment { base: 0x30_0000, len: 500 });

        // The matching single-segment remote window stays one entry.
        let remote = MemHandle::from_segments(
            &[Segment { base: 0x40_0000, len: 3000 }],
            MemAccess::WRITE,
        )
        .unwrap();
        let iov = translate_window(&remote, 500, 2000).unwrap();
        assert_eq!(iov.len(), 1);
        assert_eq!(iov[0], Segment { base: 0x40_0000 + 500, len: 2000 });
    }

    #[test]
    fn full_window_passes_through() {
        let handle = MemHandle::from_segments(&three_by_1000(), MemAccess::READ).unwrap();
        let iov = translate_window(&handle, 0, 3000).unwrap();
        assert_eq!(iov.as_slice(), handle.segments());
    }

    #[test]
    fn out_of_range_window_rejected() {
        let handle = MemHandle::new(0x1000 as *const u8, 100, MemAccess::READ);
        assert_eq!(
            translate_window(&handle, 50, 100).unwrap_err(),
            Error::InvalidArg
        );
    }

    #[test]
    fn handle_serialize_round_trip() {
        let handle =
            MemHandle::from_segments(&three_by_1000(), MemAccess::READ | MemAccess::WRITE)
                .unwrap();
        let mut buf = vec![0u8; handle.serialized_size()];
        assert_eq!(handle.serialize(&mut buf).unwrap(), buf.len());

        let back = MemHandle::deserialize(&buf).unwrap();
        assert_eq!(back.segments(), handle.segments());
        assert_eq!(back.len(), handle.len());
        assert_eq!(back.flags(), handle.flags());
    }

    #[test]
    fn serialize_needs_room() {
        let handle = MemHandle::new(0x1000 as *const u8, 64, MemAccess::READ);
        let mut buf = [0u8; 8];
        assert_eq!(handle.serialize(&mut buf).unwrap_err(), Error::Overflow);
    }

    #[test]
    fn deserialize_rejects_truncation() {
        let handle = MemHandle::new(0x1000 as *const u8, 64, MemAccess::READ);
        let mut buf = vec![0u8; handle.serialized_size()];
        handle.serialize(&mut buf).unwrap();
        assert!(MemHandle::deserialize(&buf[..16]).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn vm_copy_within_own_process() {
        let src = vec![7u8; 256];
        let mut dst = vec![0u8; 256];
        let pid = std::process::id() as i32;

        let local = [Segment {
            base: src.as_ptr() as u64,
            len: 256,
        }];
        let remote = [Segment {
            base: dst.as_mut_ptr() as u64,
            len: 256,
        }];
        let n = unsafe { vm_write(pid, &local, &remote) }.unwrap();
        assert_eq!(n, 256);
        assert_eq!(dst, src);
    }
}
