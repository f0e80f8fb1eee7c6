//! Packed 64-bit message and command headers.
//!
//! Both ring families carry a single word per entry; zero is reserved for
//! "empty slot", so every valid header has a nonzero kind byte.
//!
//! Message header layout (low to high bits):
//! - tag: 32 bits
//! - payload length: 16 bits (at most one page)
//! - buffer slot index: 8 bits
//! - kind: 8 bits
//!
//! Command header layout (low to high bits):
//! - origin PID: 32 bits
//! - origin instance ordinal: 8 bits
//! - queue-pair index: 8 bits
//! - kind: 8 bits
//! - pad: 8 bits

/// Message kinds carried in ring headers. Values share the operation-kind
/// numbering so a header can be built straight from an operation.
pub const MSG_SEND_UNEXPECTED: u8 = 1;
pub const MSG_SEND_EXPECTED: u8 = 3;

/// Command kinds carried on the command queue and control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdKind {
    /// Peer claimed a queue pair and requests wire-up.
    Reserved = 1,
    /// Peer dropped the pair.
    Released = 2,
}

impl CmdKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(CmdKind::Reserved),
            2 => Some(CmdKind::Released),
            _ => None,
        }
    }
}

/// Encode a message header.
#[inline]
pub fn encode_msg_hdr(kind: u8, buf_idx: u8, buf_size: u16, tag: u32) -> u64 {
    debug_assert!(kind != 0);
    (tag as u64)
        | ((buf_size as u64) << 32)
        | ((buf_idx as u64) << 48)
        | ((kind as u64) << 56)
}

/// Decode a message header into (kind, buf_idx, buf_size, tag).
#[inline]
pub fn decode_msg_hdr(val: u64) -> (u8, u8, u16, u32) {
    let tag = val as u32;
    let buf_size = (val >> 32) as u16;
    let buf_idx = (val >> 48) as u8;
    let kind = (val >> 56) as u8;
    (kind, buf_idx, buf_size, tag)
}

/// Encode a command header.
#[inline]
pub fn encode_cmd_hdr(kind: CmdKind, pair_idx: u8, id: u8, pid: i32) -> u64 {
    (pid as u32 as u64)
        | ((id as u64) << 32)
        | ((pair_idx as u64) << 40)
        | ((kind as u8 as u64) << 48)
}

/// Decode a command header into (kind, pair_idx, id, pid).
///
/// Returns `None` for an unknown kind byte.
#[inline]
pub fn decode_cmd_hdr(val: u64) -> Option<(CmdKind, u8, u8, i32)> {
    let pid = val as u32 as i32;
    let id = (val >> 32) as u8;
    let pair_idx = (val >> 40) as u8;
    let kind = CmdKind::from_u8((val >> 48) as u8)?;
    Some((kind, pair_idx, id, pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_hdr_round_trip() {
        let hdr = encode_msg_hdr(MSG_SEND_UNEXPECTED, 63, 4096, 0xdead_beef);
        assert_ne!(hdr, 0);
        let (kind, idx, size, tag) = decode_msg_hdr(hdr);
        assert_eq!(kind, MSG_SEND_UNEXPECTED);
        assert_eq!(idx, 63);
        assert_eq!(size, 4096);
        assert_eq!(tag, 0xdead_beef);
    }

    #[test]
    fn msg_hdr_is_nonzero_for_all_kinds() {
        for kind in [MSG_SEND_UNEXPECTED, MSG_SEND_EXPECTED] {
            assert_ne!(encode_msg_hdr(kind, 0, 0, 0), 0);
        }
    }

    #[test]
    fn cmd_hdr_round_trip() {
        let hdr = encode_cmd_hdr(CmdKind::Reserved, 255, 17, 123_456);
        let (kind, pair, id, pid) = decode_cmd_hdr(hdr).unwrap();
        assert_eq!(kind, CmdKind::Reserved);
        assert_eq!(pair, 255);
        assert_eq!(id, 17);
        assert_eq!(pid, 123_456);

        let hdr = encode_cmd_hdr(CmdKind::Released, 0, 0, i32::MAX);
        let (kind, _, _, pid) = decode_cmd_hdr(hdr).unwrap();
        assert_eq!(kind, CmdKind::Released);
        assert_eq!(pid, i32::MAX);
    }

    #[test]
    fn cmd_hdr_rejects_unknown_kind() {
        assert!(decode_cmd_hdr(0).is_none());
        assert!(decode_cmd_hdr(0xff << 48).is_none());
    }
}
