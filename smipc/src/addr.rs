//! Peer addresses.
//!
//! A peer is named `sm://<pid>/<ordinal>`. The address record carries the
//! resources needed to reach it: the mapped region, the reserved queue
//! pair, and the notifier pair, plus a protocol reference count and the
//! resolution status bits. Records come in two flavours: locally initiated
//! ones own their mapping of the peer's region, while *unexpected* records
//! (created when a peer's RESERVED command arrives) borrow the endpoint's
//! own region with the queue-pair roles inverted.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::event::Notifier;
use crate::poll::TOKEN_ADDR_BASE;
use crate::region::{MsgRing, Region, SharedRegion};

/// Queue pair reserved in the target region.
pub(crate) const ADDR_RESERVED: u32 = 1 << 0;
/// RESERVED command pushed to the target's command queue.
pub(crate) const ADDR_CMD_PUSHED: u32 = 1 << 1;
/// Wire-up complete; the record is usable for sends.
pub(crate) const ADDR_RESOLVED: u32 = 1 << 2;

/// Serialized address size: 4-byte PID + 1-byte ordinal.
pub const SERIALIZED_LEN: usize = 5;

static NEXT_POLL_TOKEN: AtomicU64 = AtomicU64::new(TOKEN_ADDR_BASE);

/// How an address reaches the shared region it communicates through.
pub(crate) enum RegionRef {
    /// Not resolved yet.
    None,
    /// A private mapping of the peer's region (locally initiated records).
    Owned(SharedRegion),
    /// The endpoint's own region (source and unexpected records).
    Borrowed(NonNull<Region>),
}

impl RegionRef {
    pub fn get(&self) -> Option<&Region> {
        match self {
            RegionRef::None => None,
            RegionRef::Owned(r) => Some(r.get()),
            RegionRef::Borrowed(p) => Some(unsafe { p.as_ref() }),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, RegionRef::None)
    }
}

/// Mutable resources of an address, serialized by one mutex so that
/// resolution, teardown and ring access cannot interleave.
pub(crate) struct AddrRes {
    pub region: RegionRef,
    pub pair_idx: u8,
    /// Ring this side pushes to.
    pub tx_ring: Option<NonNull<MsgRing>>,
    /// Ring this side pops from.
    pub rx_ring: Option<NonNull<MsgRing>>,
    /// Signalled after depositing into `tx_ring`.
    pub tx_notify: Option<Notifier>,
    /// Drained when the peer deposits into `rx_ring`; registered for
    /// polling.
    pub rx_notify: Option<Notifier>,
}

/// A routing record for one peer endpoint.
pub struct Addr {
    pid: i32,
    id: u8,
    unexpected: bool,
    poll_token: u64,
    pub(crate) ref_count: AtomicI32,
    pub(crate) status: AtomicU32,
    pub(crate) res: Mutex<AddrRes>,
}

// Raw ring/region pointers are only dereferenced while the mapping is
// alive, which the reference-count protocol guarantees.
unsafe impl Send for Addr {}
unsafe impl Sync for Addr {}

impl Addr {
    pub(crate) fn new(pid: i32, id: u8, unexpected: bool) -> Arc<Self> {
        Arc::new(Self {
            pid,
            id,
            unexpected,
            poll_token: NEXT_POLL_TOKEN.fetch_add(1, Ordering::Relaxed),
            ref_count: AtomicI32::new(1),
            status: AtomicU32::new(0),
            res: Mutex::new(AddrRes {
                region: RegionRef::None,
                pair_idx: 0,
                tx_ring: None,
                rx_ring: None,
                tx_notify: None,
                rx_notify: None,
            }),
        })
    }

    /// Owning process identifier.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Instance ordinal within the owning process.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Whether this record was created by a peer's RESERVED command.
    pub(crate) fn is_unexpected(&self) -> bool {
        self.unexpected
    }

    pub(crate) fn poll_token(&self) -> u64 {
        self.poll_token
    }

    pub(crate) fn key(&self) -> u64 {
        addr_key(self.pid, self.id)
    }

    pub(crate) fn has_status(&self, bit: u32) -> bool {
        self.status.load(Ordering::Acquire) & bit != 0
    }

    pub(crate) fn set_status(&self, bit: u32) {
        self.status.fetch_or(bit, Ordering::AcqRel);
    }

    pub(crate) fn clear_status(&self, bit: u32) {
        self.status.fetch_and(!bit, Ordering::AcqRel);
    }

    /// Same (pid, ordinal) identity.
    pub fn same_endpoint(&self, other: &Addr) -> bool {
        self.pid == other.pid && self.id == other.id
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm://{}/{}", self.pid, self.id)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("pid", &self.pid)
            .field("id", &self.id)
            .field("unexpected", &self.unexpected)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("status", &self.status.load(Ordering::Relaxed))
            .finish()
    }
}

/// Map (pid, ordinal) onto the address-map key.
pub(crate) fn addr_key(pid: i32, id: u8) -> u64 {
    ((pid as u32 as u64) << 32) | id as u64
}

/// Parse an `sm://<pid>/<ordinal>` string; the scheme prefix is optional.
pub fn parse_addr(s: &str) -> Result<(i32, u8)> {
    let short = match s.find("://") {
        Some(pos) => &s[pos + 3..],
        None => s,
    };
    let mut parts = short.split('/');
    let pid = parts
        .next()
        .and_then(|p| p.parse::<i32>().ok())
        .ok_or(Error::InvalidArg)?;
    let id = parts
        .next()
        .and_then(|p| p.parse::<u8>().ok())
        .ok_or(Error::InvalidArg)?;
    if parts.next().is_some() {
        return Err(Error::InvalidArg);
    }
    Ok((pid, id))
}

/// Serialize (pid, ordinal) into `buf`.
pub fn serialize_addr(pid: i32, id: u8, buf: &mut [u8]) -> Result<()> {
    if buf.len() < SERIALIZED_LEN {
        return Err(Error::Overflow);
    }
    buf[..4].copy_from_slice(&pid.to_le_bytes());
    buf[4] = id;
    Ok(())
}

/// Deserialize (pid, ordinal) from `buf`.
pub fn deserialize_addr(buf: &[u8]) -> Result<(i32, u8)> {
    if buf.len() < SERIALIZED_LEN {
        return Err(Error::Overflow);
    }
    let pid = i32::from_le_bytes(buf[..4].try_into().unwrap());
    Ok((pid, buf[4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_and_without_scheme() {
        assert_eq!(parse_addr("sm://1234/7").unwrap(), (1234, 7));
        assert_eq!(parse_addr("1234/7").unwrap(), (1234, 7));
        assert_eq!(parse_addr("sm://1/0").unwrap(), (1, 0));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_addr("").is_err());
        assert!(parse_addr("sm://").is_err());
        assert!(parse_addr("sm://abc/0").is_err());
        assert!(parse_addr("sm://12").is_err());
        assert!(parse_addr("sm://12/999").is_err());
        assert!(parse_addr("sm://12/0/1").is_err());
    }

    #[test]
    fn serialize_round_trip() {
        let mut buf = [0u8; SERIALIZED_LEN];
        serialize_addr(431_207, 12, &mut buf).unwrap();
        assert_eq!(deserialize_addr(&buf).unwrap(), (431_207, 12));

        let mut small = [0u8; 4];
        assert_eq!(
            serialize_addr(1, 1, &mut small).unwrap_err(),
            Error::Overflow
        );
    }

    #[test]
    fn display_matches_string_form() {
        let addr = Addr::new(99, 3, false);
        assert_eq!(addr.to_string(), "sm://99/3");
        let (pid, id) = parse_addr(&addr.to_string()).unwrap();
        assert!(pid == 99 && id == 3);
    }
}
