//! The shared-memory endpoint.
//!
//! An endpoint owns one SHM region (when listening), a control socket, a
//! poll set, the address map and the four operation queues. Any thread may
//! post operations, drive [`Endpoint::progress`] or cancel; transient
//! back-pressure parks operations on the retry queue instead of surfacing
//! to the caller.

use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use nix::sys::epoll::EpollEvent;

use crate::addr::{
    addr_key, deserialize_addr, parse_addr, serialize_addr, Addr, RegionRef, ADDR_CMD_PUSHED,
    ADDR_RESERVED, ADDR_RESOLVED,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::Notifier;
use crate::mem::{translate_window, vm_read, vm_write, MemAccess, MemHandle};
use crate::msg::{
    decode_cmd_hdr, decode_msg_hdr, encode_cmd_hdr, encode_msg_hdr, CmdKind, MSG_SEND_EXPECTED,
    MSG_SEND_UNEXPECTED,
};
use crate::op::{
    Completion, CompletionCallback, OpId, OpKind, OP_CANCELED, OP_COMPLETED, OP_QUEUED,
};
use crate::poll::{PollSet, MAX_EVENTS, TOKEN_SOCK, TOKEN_TX_NOTIFY};
use crate::region::{Region, SharedRegion};
use crate::sock::ControlSock;
use crate::{MAX_MSG_SIZE, MAX_TAG};

/// Process-wide instance ordinal source. Endpoint identity is
/// (pid, ordinal), so the counter must be shared by every endpoint the
/// process opens, whichever thread opens it.
static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A message that arrived before any matching receive was posted.
struct UnexpectedInfo {
    addr: Arc<Addr>,
    buf: Vec<u8>,
    tag: u32,
}

/// Intra-node shared-memory endpoint.
pub struct Endpoint {
    username: String,
    pid: i32,
    id: u8,
    listen: bool,
    max_contexts: u8,

    region: Option<SharedRegion>,
    loopback_pair: Option<u8>,

    addr_map: RwLock<HashMap<u64, Arc<Addr>>>,
    poll_addr_list: Mutex<Vec<Arc<Addr>>>,
    source_addr: Arc<Addr>,

    unexpected_msg_queue: Mutex<VecDeque<UnexpectedInfo>>,
    unexpected_op_queue: Mutex<VecDeque<Arc<OpId>>>,
    expected_op_queue: Mutex<VecDeque<Arc<OpId>>>,
    retry_op_queue: Mutex<VecDeque<Arc<OpId>>>,

    poll_set: Option<PollSet>,
    sock: Option<ControlSock>,
    tx_notify: Option<Notifier>,

    nofile: AtomicI32,
    nofile_max: u64,

    closed: bool,
}

impl Endpoint {
    /// Open an endpoint for this process.
    ///
    /// Takes the next process-wide instance ordinal; at most 256 endpoints
    /// can be opened per process lifetime. Listening endpoints create
    /// their shared region and a bound control socket; unless `no_wait`
    /// is set, a poll set and completion notifier are created so progress
    /// can block.
    pub fn open(config: Config) -> Result<Self> {
        let username = login_name()?;
        let pid = std::process::id() as i32;

        let id = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        if id > u8::MAX as u32 {
            return Err(Error::Overflow);
        }
        let id = id as u8;

        let (nofile_max, _hard) =
            nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)?;

        tracing::debug!(%username, pid, id, listen = config.listen, "opening endpoint");

        let mut endpoint = Self {
            username,
            pid,
            id,
            listen: config.listen,
            max_contexts: config.max_contexts,
            region: None,
            loopback_pair: None,
            addr_map: RwLock::new(HashMap::new()),
            poll_addr_list: Mutex::new(Vec::new()),
            source_addr: Addr::new(pid, id, false),
            unexpected_msg_queue: Mutex::new(VecDeque::new()),
            unexpected_op_queue: Mutex::new(VecDeque::new()),
            expected_op_queue: Mutex::new(VecDeque::new()),
            retry_op_queue: Mutex::new(VecDeque::new()),
            poll_set: None,
            sock: None,
            tx_notify: None,
            nofile: AtomicI32::new(0),
            nofile_max,
            closed: false,
        };

        if let Err(e) = endpoint.open_resources(config.no_wait) {
            endpoint.closed = true; // resources were rolled back piecemeal
            return Err(e);
        }
        Ok(endpoint)
    }

    fn open_resources(&mut self, no_wait: bool) -> Result<()> {
        if self.listen {
            let region = SharedRegion::create(&self.username, self.pid, self.id)?;
            let pair = region.get().reserve_pair().ok_or(Error::Again)?;
            self.loopback_pair = Some(pair);

            {
                let mut res = self.source_addr.res.lock().unwrap();
                res.region = RegionRef::Borrowed(region.ptr());
                res.pair_idx = pair;
                let qp = region.get().queue_pair(pair);
                res.tx_ring = Some(NonNull::from(&qp.rx));
                res.rx_ring = Some(NonNull::from(&qp.tx));
            }
            self.region = Some(region);
        }

        if !no_wait {
            let poll_set = PollSet::new()?;
            self.nofile.fetch_add(1, Ordering::AcqRel);

            let sock = ControlSock::open(&self.username, self.pid, self.id, self.listen)?;
            self.nofile.fetch_add(1, Ordering::AcqRel);
            if self.listen {
                poll_set.register(sock.as_fd(), TOKEN_SOCK)?;
            }

            // Wakes a blocked progress thread when another thread
            // completes a send locally.
            let tx_notify = Notifier::new()?;
            self.nofile.fetch_add(1, Ordering::AcqRel);
            poll_set.register(tx_notify.as_fd(), TOKEN_TX_NOTIFY)?;

            self.poll_set = Some(poll_set);
            self.sock = Some(sock);
            self.tx_notify = Some(tx_notify);
        }

        Ok(())
    }

    /// Close the endpoint.
    ///
    /// Remaining peer-initiated addresses are torn down; the call refuses
    /// with [`Error::Busy`] while any operation or unexpected message is
    /// still queued, or if descriptors remain open afterwards.
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        tracing::debug!(pid = self.pid, id = self.id, "closing endpoint");

        let leftovers: Vec<Arc<Addr>> = {
            let mut list = self.poll_addr_list.lock().unwrap();
            std::mem::take(&mut *list)
        };
        for addr in leftovers {
            self.addr_destroy(&addr)?;
        }

        if !self.unexpected_msg_queue.lock().unwrap().is_empty()
            || !self.unexpected_op_queue.lock().unwrap().is_empty()
            || !self.expected_op_queue.lock().unwrap().is_empty()
            || !self.retry_op_queue.lock().unwrap().is_empty()
        {
            return Err(Error::Busy);
        }

        // Detach the source address before the region unmaps; user-held
        // clones must not dangle.
        {
            let mut res = self.source_addr.res.lock().unwrap();
            res.region = RegionRef::None;
            res.tx_ring = None;
            res.rx_ring = None;
        }
        if let Some(region) = self.region.take() {
            if let Some(pair) = self.loopback_pair.take() {
                region.get().release_pair(pair);
            }
            drop(region); // owner: unmaps and unlinks
        }

        if let Some(txn) = self.tx_notify.take() {
            if let Some(ps) = &self.poll_set {
                let _ = ps.deregister(txn.as_fd());
            }
            drop(txn);
            self.nofile.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(sock) = self.sock.take() {
            if self.listen {
                if let Some(ps) = &self.poll_set {
                    let _ = ps.deregister(sock.as_fd());
                }
            }
            sock.close()?;
            self.nofile.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(ps) = self.poll_set.take() {
            drop(ps);
            self.nofile.fetch_sub(1, Ordering::AcqRel);
        }

        self.addr_map.write().unwrap().clear();

        let open = self.nofile.load(Ordering::Acquire);
        if open != 0 {
            tracing::warn!(open, "descriptors remain open at endpoint close");
            return Err(Error::Busy);
        }

        self.closed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// This endpoint's own address. The returned reference must be
    /// released with [`Endpoint::addr_free`].
    pub fn self_addr(&self) -> Arc<Addr> {
        self.source_addr.ref_count.fetch_add(1, Ordering::AcqRel);
        self.source_addr.clone()
    }

    /// Whether this endpoint accepts incoming peers.
    pub fn listening(&self) -> bool {
        self.listen
    }

    /// Largest payload for unexpected and expected messages.
    pub fn max_msg_size(&self) -> usize {
        MAX_MSG_SIZE
    }

    /// Largest usable tag.
    pub fn max_tag(&self) -> u32 {
        MAX_TAG
    }

    /// Maximum execution contexts configured for this endpoint.
    pub fn max_contexts(&self) -> u8 {
        self.max_contexts
    }

    /// Live count of descriptors owned by this endpoint.
    pub fn open_fd_count(&self) -> i32 {
        self.nofile.load(Ordering::Acquire)
    }

    /// Descriptor ceiling read from `RLIMIT_NOFILE` at open.
    pub fn open_fd_max(&self) -> u64 {
        self.nofile_max
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    /// Look up (or create) the address record for `name`
    /// (`sm://<pid>/<ordinal>`). Each successful lookup takes one
    /// reference; release it with [`Endpoint::addr_free`].
    pub fn addr_lookup(&self, name: &str) -> Result<Arc<Addr>> {
        let (pid, id) = parse_addr(name)?;
        let key = addr_key(pid, id);

        if let Some(addr) = self.addr_map.read().unwrap().get(&key) {
            addr.ref_count.fetch_add(1, Ordering::AcqRel);
            return Ok(addr.clone());
        }

        // Re-check and construct under the write lock so duplicate
        // inserts linearize.
        let mut map = self.addr_map.write().unwrap();
        let addr = map.entry(key).or_insert_with(|| {
            tracing::debug!(pid, id, "created address record");
            Addr::new(pid, id, false)
        });
        addr.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(addr.clone())
    }

    /// Release one reference on `addr`.
    ///
    /// When the last explicit hold on a locally initiated record goes
    /// away, the record leaves the map and the RELEASED exchange runs;
    /// peer-initiated records wait for the peer's RELEASED command.
    pub fn addr_free(&self, addr: &Arc<Addr>) -> Result<()> {
        self.release_ref(addr);
        Ok(())
    }

    /// Serialize `addr` into `buf` (5 bytes).
    pub fn addr_serialize(&self, addr: &Addr, buf: &mut [u8]) -> Result<()> {
        serialize_addr(addr.pid(), addr.id(), buf)
    }

    /// Recover a previously serialized address. The record must already
    /// be known to this endpoint.
    pub fn addr_deserialize(&self, buf: &[u8]) -> Result<Arc<Addr>> {
        let (pid, id) = deserialize_addr(buf)?;
        let key = addr_key(pid, id);
        let map = self.addr_map.read().unwrap();
        let addr = map.get(&key).ok_or(Error::NoEntry)?;
        addr.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(addr.clone())
    }

    fn release_ref(&self, addr: &Arc<Addr>) {
        let remaining = addr.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 1 {
            return;
        }

        if remaining == 1 {
            // Only the container hold is left. Peer-initiated records are
            // held by the poll list until the peer's RELEASED arrives.
            if addr.is_unexpected() {
                return;
            }
            let mut map = self.addr_map.write().unwrap();
            match map.get(&addr.key()) {
                Some(existing) if Arc::ptr_eq(existing, addr) => {
                    if addr.ref_count.load(Ordering::Acquire) != 1 {
                        // Revived by a concurrent lookup.
                        return;
                    }
                    map.remove(&addr.key());
                    addr.ref_count.store(0, Ordering::Release);
                }
                _ => return, // not mapped (e.g. the source address)
            }
        } else if remaining < 0 {
            tracing::warn!(%addr, "reference count went negative");
            return;
        }

        self.remove_from_poll_list(addr);
        if let Err(e) = self.addr_destroy(addr) {
            tracing::warn!(%addr, error = %e, "address teardown failed");
        }
    }

    fn remove_from_poll_list(&self, addr: &Arc<Addr>) {
        let mut list = self.poll_addr_list.lock().unwrap();
        list.retain(|a| !Arc::ptr_eq(a, addr));
    }

    /// Tear down an address's resources: release or announce the queue
    /// pair, destroy notifiers, drop the mapping.
    fn addr_destroy(&self, addr: &Arc<Addr>) -> Result<()> {
        let mut res = addr.res.lock().unwrap();
        if res.region.is_none() {
            return Ok(());
        }
        tracing::debug!(%addr, "destroying address");

        if addr.is_unexpected() {
            // The pair lives in our own region; give the slot back.
            if let Some(region) = res.region.get() {
                region.release_pair(res.pair_idx);
            }
        } else {
            let cmd = encode_cmd_hdr(CmdKind::Released, res.pair_idx, self.id, self.pid);
            if let Some(sock) = &self.sock {
                // Best-effort: the peer may already be gone.
                sock.send_cmd(&self.username, addr.pid(), addr.id(), cmd, None, true)?;
            } else if let Some(region) = res.region.get() {
                if !region.cmd_queue.push(cmd) {
                    return Err(Error::Again);
                }
            }
        }

        if let Some(txn) = res.tx_notify.take() {
            drop(txn);
            self.nofile.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(rxn) = res.rx_notify.take() {
            if let Some(ps) = &self.poll_set {
                let _ = ps.deregister(rxn.as_fd());
            }
            drop(rxn);
            self.nofile.fetch_sub(1, Ordering::AcqRel);
        }

        res.tx_ring = None;
        res.rx_ring = None;
        res.region = RegionRef::None; // unmaps when this side owned the mapping
        addr.clear_status(ADDR_RESERVED | ADDR_CMD_PUSHED | ADDR_RESOLVED);
        Ok(())
    }

    /// Wire up communication with a peer: map its region, reserve a queue
    /// pair there, announce it on the peer's command queue and (when
    /// polling) pass the notifier descriptors over the control socket.
    ///
    /// Every step is idempotent behind a status bit, so an
    /// [`Error::Again`] (no free pair, full command queue, descriptor
    /// pass throttled) can be retried without redoing earlier steps.
    fn addr_resolve(&self, addr: &Arc<Addr>) -> Result<()> {
        let mut res = addr.res.lock().unwrap();
        if addr.has_status(ADDR_RESOLVED) {
            return Ok(());
        }

        if res.region.is_none() {
            res.region =
                RegionRef::Owned(SharedRegion::open(&self.username, addr.pid(), addr.id())?);
        }

        let step = (|| -> Result<()> {
            if !addr.has_status(ADDR_RESERVED) {
                // We are the initiator: we write the owner's rx ring and
                // read the owner's tx ring.
                let (pair, tx_ring, rx_ring) = {
                    let region = res.region.get().unwrap();
                    let pair = region.reserve_pair().ok_or(Error::Again)?;
                    let qp = region.queue_pair(pair);
                    (pair, NonNull::from(&qp.rx), NonNull::from(&qp.tx))
                };
                res.pair_idx = pair;
                res.tx_ring = Some(tx_ring);
                res.rx_ring = Some(rx_ring);
                addr.set_status(ADDR_RESERVED);
            }

            let cmd = encode_cmd_hdr(CmdKind::Reserved, res.pair_idx, self.id, self.pid);

            if !addr.has_status(ADDR_CMD_PUSHED) {
                let region = res.region.get().unwrap();
                if !region.cmd_queue.push(cmd) {
                    return Err(Error::Again);
                }
                addr.set_status(ADDR_CMD_PUSHED);
            }

            if let Some(poll_set) = &self.poll_set {
                if res.tx_notify.is_none() {
                    res.tx_notify = Some(Notifier::new()?);
                    self.nofile.fetch_add(1, Ordering::AcqRel);
                }
                if res.rx_notify.is_none() {
                    let notifier = Notifier::new()?;
                    poll_set.register(notifier.as_fd(), addr.poll_token())?;
                    self.nofile.fetch_add(1, Ordering::AcqRel);
                    res.rx_notify = Some(notifier);
                }

                let sock = self.sock.as_ref().ok_or(Error::Protocol)?;
                sock.send_cmd(
                    &self.username,
                    addr.pid(),
                    addr.id(),
                    cmd,
                    Some((
                        res.tx_notify.as_ref().unwrap().as_fd(),
                        res.rx_notify.as_ref().unwrap().as_fd(),
                    )),
                    false,
                )?;
            }
            Ok(())
        })();

        match step {
            Ok(()) => {}
            Err(Error::Again) => return Err(Error::Again),
            Err(e) => {
                self.rollback_resolve(addr, &mut res);
                return Err(e);
            }
        }

        addr.set_status(ADDR_RESOLVED);
        drop(res);

        self.poll_addr_list.lock().unwrap().push(addr.clone());
        tracing::debug!(%addr, "resolved");
        Ok(())
    }

    fn rollback_resolve(&self, addr: &Arc<Addr>, res: &mut crate::addr::AddrRes) {
        if addr.has_status(ADDR_RESERVED) {
            if let Some(region) = res.region.get() {
                region.release_pair(res.pair_idx);
            }
            addr.clear_status(ADDR_RESERVED);
        }
        if let Some(txn) = res.tx_notify.take() {
            drop(txn);
            self.nofile.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(rxn) = res.rx_notify.take() {
            if let Some(ps) = &self.poll_set {
                let _ = ps.deregister(rxn.as_fd());
            }
            drop(rxn);
            self.nofile.fetch_sub(1, Ordering::AcqRel);
        }
        res.tx_ring = None;
        res.rx_ring = None;
        res.region = RegionRef::None;
    }

    // ------------------------------------------------------------------
    // Message paths
    // ------------------------------------------------------------------

    /// Post an unexpected-mode send of `buf[..buf_size]` to `dest`.
    ///
    /// Returns as soon as the payload is deposited and the peer notified,
    /// or parks the operation for retry under back-pressure; either way a
    /// successful return means `callback` will fire exactly once.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid for reads of `buf_size` bytes until the
    /// operation completes.
    pub unsafe fn msg_send_unexpected(
        &self,
        op: &Arc<OpId>,
        buf: *const u8,
        buf_size: usize,
        dest: &Arc<Addr>,
        tag: u32,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<()> {
        self.msg_send(
            OpKind::SendUnexpected,
            op,
            buf,
            buf_size,
            dest,
            tag,
            Box::new(callback),
        )
    }

    /// Post an expected-mode send. The receiver must have pre-posted a
    /// matching receive for (our address, `tag`).
    ///
    /// # Safety
    ///
    /// `buf` must stay valid for reads of `buf_size` bytes until the
    /// operation completes.
    pub unsafe fn msg_send_expected(
        &self,
        op: &Arc<OpId>,
        buf: *const u8,
        buf_size: usize,
        dest: &Arc<Addr>,
        tag: u32,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<()> {
        self.msg_send(
            OpKind::SendExpected,
            op,
            buf,
            buf_size,
            dest,
            tag,
            Box::new(callback),
        )
    }

    fn msg_send(
        &self,
        kind: OpKind,
        op: &Arc<OpId>,
        buf: *const u8,
        buf_size: usize,
        dest: &Arc<Addr>,
        tag: u32,
        callback: CompletionCallback,
    ) -> Result<()> {
        if buf_size > MAX_MSG_SIZE {
            return Err(Error::Overflow);
        }
        self.claim_op(op)?;

        dest.ref_count.fetch_add(1, Ordering::AcqRel);
        {
            let mut inner = op.inner.lock().unwrap();
            inner.kind = kind;
            inner.callback = Some(callback);
            inner.buf = buf as *mut u8;
            inner.buf_size = buf_size;
            inner.actual_size = buf_size;
            inner.tag = tag;
            inner.addr = Some(dest.clone());
        }

        if !dest.has_status(ADDR_RESOLVED) {
            match self.addr_resolve(dest) {
                Ok(()) => {}
                Err(Error::Again) => {
                    self.op_retry(op);
                    return Ok(());
                }
                Err(e) => {
                    self.fail_op(op);
                    return Err(e);
                }
            }
        }

        let buf_idx = {
            let res = dest.res.lock().unwrap();
            res.region.get().and_then(|r| r.copy_bufs.reserve())
        };
        let Some(buf_idx) = buf_idx else {
            self.op_retry(op);
            return Ok(());
        };

        match self.finish_send(op, dest, buf_idx) {
            Ok(()) => {
                self.complete_op(op, Ok(()), true);
                Ok(())
            }
            Err(e) => {
                self.fail_op(op);
                Err(e)
            }
        }
    }

    /// Copy the payload into the reserved slot, publish the header on the
    /// destination's rx ring, and signal the peer.
    fn finish_send(&self, op: &Arc<OpId>, dest: &Arc<Addr>, buf_idx: u32) -> Result<()> {
        let res = dest.res.lock().unwrap();
        let region = res.region.get().ok_or(Error::Protocol)?;

        let hdr = {
            let inner = op.inner.lock().unwrap();
            unsafe { region.copy_bufs.copy_to(buf_idx, inner.buf, inner.buf_size) };
            encode_msg_hdr(
                inner.kind.msg_kind(),
                buf_idx as u8,
                inner.buf_size as u16,
                inner.tag,
            )
        };

        let tx = res.tx_ring.ok_or(Error::Protocol)?;
        if !unsafe { tx.as_ref() }.push(hdr) {
            // Resolution succeeded but the ring is full: the peer has
            // stalled. This is the one back-pressure signal that
            // propagates.
            region.copy_bufs.release(buf_idx);
            return Err(Error::Again);
        }

        if let Some(txn) = &res.tx_notify {
            txn.signal()?;
        }
        Ok(())
    }

    /// Post an unexpected-mode receive.
    ///
    /// If an unexpected message is already held, it completes immediately
    /// (the completion carries the sender, whose reference the caller now
    /// owns); otherwise the operation parks until one arrives.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid for writes of `buf_size` bytes until the
    /// operation completes.
    pub unsafe fn msg_recv_unexpected(
        &self,
        op: &Arc<OpId>,
        buf: *mut u8,
        buf_size: usize,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<()> {
        if buf_size > MAX_MSG_SIZE {
            return Err(Error::Overflow);
        }
        self.claim_op(op)?;
        {
            let mut inner = op.inner.lock().unwrap();
            inner.kind = OpKind::RecvUnexpected;
            inner.callback = Some(Box::new(callback));
            inner.buf = buf;
            inner.buf_size = buf_size;
            inner.actual_size = 0;
            inner.tag = 0;
            inner.addr = None;
        }

        let held = self.unexpected_msg_queue.lock().unwrap().pop_front();
        if let Some(info) = held {
            {
                let mut inner = op.inner.lock().unwrap();
                info.addr.ref_count.fetch_add(1, Ordering::AcqRel);
                inner.addr = Some(info.addr.clone());
                let n = info.buf.len().min(inner.buf_size);
                unsafe { std::ptr::copy_nonoverlapping(info.buf.as_ptr(), inner.buf, n) };
                inner.actual_size = n;
                inner.tag = info.tag;
            }
            self.complete_op(op, Ok(()), true);
        } else {
            let mut queue = self.unexpected_op_queue.lock().unwrap();
            queue.push_back(op.clone());
            op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Post an expected-mode receive for (`source`, `tag`).
    ///
    /// Expected messages must be pre-posted: the operation always parks
    /// until the matching send arrives.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid for writes of `buf_size` bytes until the
    /// operation completes.
    pub unsafe fn msg_recv_expected(
        &self,
        op: &Arc<OpId>,
        buf: *mut u8,
        buf_size: usize,
        source: &Arc<Addr>,
        tag: u32,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<()> {
        if buf_size > MAX_MSG_SIZE {
            return Err(Error::Overflow);
        }
        self.claim_op(op)?;

        source.ref_count.fetch_add(1, Ordering::AcqRel);
        {
            let mut inner = op.inner.lock().unwrap();
            inner.kind = OpKind::RecvExpected;
            inner.callback = Some(Box::new(callback));
            inner.buf = buf;
            inner.buf_size = buf_size;
            inner.actual_size = 0;
            inner.tag = tag;
            inner.addr = Some(source.clone());
        }

        let mut queue = self.expected_op_queue.lock().unwrap();
        queue.push_back(op.clone());
        op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
        Ok(())
    }

    /// Take `op` out of the COMPLETED state for a new submission.
    fn claim_op(&self, op: &Arc<OpId>) -> Result<()> {
        let mut cur = op.status.load(Ordering::Acquire);
        loop {
            if cur & OP_COMPLETED == 0 {
                return Err(Error::Busy);
            }
            match op
                .status
                .compare_exchange_weak(cur, 0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(c) => cur = c,
            }
        }
    }

    /// Roll a failed synchronous submission back to COMPLETED.
    fn fail_op(&self, op: &Arc<OpId>) {
        let addr = {
            let mut inner = op.inner.lock().unwrap();
            inner.callback = None;
            inner.addr.take()
        };
        op.status.store(OP_COMPLETED, Ordering::Release);
        if let Some(addr) = addr {
            self.release_ref(&addr);
        }
    }

    /// Park `op` on the retry queue; progress drains it.
    fn op_retry(&self, op: &Arc<OpId>) {
        tracing::debug!("parking operation for retry");
        let mut queue = self.retry_op_queue.lock().unwrap();
        queue.push_back(op.clone());
        op.status.fetch_or(OP_QUEUED, Ordering::AcqRel);
    }

    /// Complete `op`: set COMPLETED, resolve the cancel race, run the
    /// callback, release the operation's address reference, and (when
    /// `notify` is set) wake any progress thread blocked in the poll set.
    fn complete_op(&self, op: &Arc<OpId>, result: Result<()>, notify: bool) {
        let prev = op.status.fetch_or(OP_COMPLETED, Ordering::AcqRel);
        let canceled = prev & OP_CANCELED != 0;

        let (callback, completion, addr) = {
            let mut inner = op.inner.lock().unwrap();
            let callback = inner.callback.take();
            let result = if canceled { Err(Error::Canceled) } else { result };

            let completion = match inner.kind {
                OpKind::RecvUnexpected if result.is_ok() => {
                    // Hand the caller its own reference on the source.
                    let source = inner.addr.clone();
                    if let Some(src) = &source {
                        src.ref_count.fetch_add(1, Ordering::AcqRel);
                    }
                    Completion {
                        kind: inner.kind,
                        result,
                        actual_size: inner.actual_size,
                        tag: inner.tag,
                        source,
                    }
                }
                OpKind::RecvUnexpected => Completion {
                    kind: inner.kind,
                    result,
                    actual_size: 0,
                    tag: 0,
                    source: None,
                },
                kind => Completion {
                    kind,
                    result,
                    actual_size: inner.actual_size,
                    tag: inner.tag,
                    source: None,
                },
            };
            (callback, completion, inner.addr.take())
        };

        if let Some(callback) = callback {
            callback(completion);
        }
        if let Some(addr) = addr {
            self.release_ref(&addr);
        }
        if notify {
            if let Some(txn) = &self.tx_notify {
                let _ = txn.signal();
            }
        }
    }

    // ------------------------------------------------------------------
    // Progress engine
    // ------------------------------------------------------------------

    /// Drive outstanding work for up to `timeout_ms` milliseconds.
    ///
    /// Returns `Ok(())` once anything progressed (a message or command
    /// was handled, a notifier fired), or [`Error::Timeout`] when the
    /// deadline passes without progress. Retried operations are serviced
    /// on every pass.
    pub fn progress(&self, timeout_ms: u32) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u32;

            let progressed = if let Some(poll_set) = &self.poll_set {
                self.poll_wait(poll_set, remaining)?
            } else {
                self.poll_scan()?
            };

            self.process_retries()?;

            if progressed {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Blocking progress: wait on the poll set, dispatch fired events.
    fn poll_wait(&self, poll_set: &PollSet, timeout_ms: u32) -> Result<bool> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let n = poll_set.wait(&mut events, timeout_ms)?;

        let mut progressed = false;
        for event in &events[..n] {
            match event.data() {
                TOKEN_SOCK => {
                    progressed |= self.progress_sock()?;
                }
                TOKEN_TX_NOTIFY => {
                    if let Some(txn) = &self.tx_notify {
                        progressed |= txn.drain()?;
                    }
                }
                token => {
                    let addr = {
                        let list = self.poll_addr_list.lock().unwrap();
                        list.iter().find(|a| a.poll_token() == token).cloned()
                    };
                    match addr {
                        Some(addr) => {
                            {
                                let res = addr.res.lock().unwrap();
                                if let Some(rxn) = &res.rx_notify {
                                    progressed |= rxn.drain()?;
                                }
                            }
                            progressed |= self.progress_rx_ring(&addr)?;
                        }
                        None => {
                            // The address was torn down between the event
                            // firing and us dispatching it.
                            tracing::debug!(token, "event for departed address");
                        }
                    }
                }
            }
        }
        Ok(progressed)
    }

    /// Non-blocking progress: scan every polled address's rx ring, and
    /// the command queue when listening.
    fn poll_scan(&self) -> Result<bool> {
        let addrs: Vec<Arc<Addr>> = self.poll_addr_list.lock().unwrap().clone();
        let mut progressed = false;
        for addr in addrs {
            progressed |= self.progress_rx_ring(&addr)?;
        }

        if let Some(region) = &self.region {
            if let Some(val) = region.get().cmd_queue.pop() {
                self.process_cmd(val, None)?;
                progressed = true;
            }
        }
        Ok(progressed)
    }

    /// Receive and process one control-socket datagram, if pending.
    fn progress_sock(&self) -> Result<bool> {
        let sock = self.sock.as_ref().ok_or(Error::Protocol)?;
        match sock.recv_cmd()? {
            None => Ok(false),
            Some((cmd, fds)) => {
                self.process_cmd(cmd, fds)?;
                Ok(true)
            }
        }
    }

    /// Handle a RESERVED or RELEASED command from a peer.
    fn process_cmd(&self, val: u64, fds: Option<(OwnedFd, OwnedFd)>) -> Result<()> {
        let Some((kind, pair_idx, id, pid)) = decode_cmd_hdr(val) else {
            // Unknown command; any smuggled descriptors close on drop.
            tracing::debug!(val, "dropping unknown command");
            return Ok(());
        };
        tracing::debug!(?kind, pid, id, pair_idx, "processing command");

        match kind {
            CmdKind::Reserved => {
                let region = self.region.as_ref().ok_or(Error::Protocol)?;
                let addr = Addr::new(pid, id, true);
                {
                    let mut res = addr.res.lock().unwrap();
                    res.region = RegionRef::Borrowed(region.ptr());
                    res.pair_idx = pair_idx;
                    let qp = region.get().queue_pair(pair_idx);
                    // Region owner: rx is where the peer deposits.
                    res.tx_ring = Some(NonNull::from(&qp.tx));
                    res.rx_ring = Some(NonNull::from(&qp.rx));

                    if let Some((peer_tx, peer_rx)) = fds {
                        // Invert roles: the peer signals its tx-notify
                        // when it deposits for us, so that is our rx side.
                        let rx_notify = Notifier::from_peer(peer_tx);
                        let tx_notify = Notifier::from_peer(peer_rx);
                        self.nofile.fetch_add(2, Ordering::AcqRel);

                        if let Some(poll_set) = &self.poll_set {
                            poll_set.register(rx_notify.as_fd(), addr.poll_token())?;
                        }
                        res.rx_notify = Some(rx_notify);
                        res.tx_notify = Some(tx_notify);
                    }
                }
                addr.set_status(ADDR_RESOLVED);
                self.poll_addr_list.lock().unwrap().push(addr);
            }
            CmdKind::Released => {
                let found = {
                    let list = self.poll_addr_list.lock().unwrap();
                    list.iter()
                        .find(|a| {
                            a.is_unexpected()
                                && a.pid() == pid
                                && a.id() == id
                                && a.res.lock().unwrap().pair_idx == pair_idx
                        })
                        .cloned()
                };
                match found {
                    Some(addr) => self.release_ref(&addr),
                    None => {
                        tracing::debug!(pid, id, pair_idx, "release for unknown address");
                    }
                }
            }
        }
        Ok(())
    }

    /// Pop and dispatch one header from `addr`'s rx ring.
    fn progress_rx_ring(&self, addr: &Arc<Addr>) -> Result<bool> {
        let to_complete = {
            let res = addr.res.lock().unwrap();
            let Some(rx) = res.rx_ring else {
                return Ok(false);
            };
            let Some(val) = unsafe { rx.as_ref() }.pop() else {
                return Ok(false);
            };

            let (kind, buf_idx, buf_size, tag) = decode_msg_hdr(val);
            let region = res.region.get().ok_or(Error::Protocol)?;

            match kind {
                MSG_SEND_UNEXPECTED => {
                    self.process_unexpected(addr, region, buf_idx as u32, buf_size as usize, tag)?
                }
                MSG_SEND_EXPECTED => Some(self.process_expected(
                    addr,
                    region,
                    buf_idx as u32,
                    buf_size as usize,
                    tag,
                )?),
                _ => return Err(Error::InvalidArg),
            }
        };

        if let Some(op) = to_complete {
            self.complete_op(&op, Ok(()), false);
        }
        Ok(true)
    }

    /// An unexpected-send header arrived: match a posted receive, or park
    /// the payload on the holding queue.
    fn process_unexpected(
        &self,
        addr: &Arc<Addr>,
        region: &Region,
        buf_idx: u32,
        buf_size: usize,
        tag: u32,
    ) -> Result<Option<Arc<OpId>>> {
        let op = {
            let mut queue = self.unexpected_op_queue.lock().unwrap();
            let op = queue.pop_front();
            if let Some(op) = &op {
                op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
            }
            op
        };

        match op {
            Some(op) => {
                {
                    let mut inner = op.inner.lock().unwrap();
                    addr.ref_count.fetch_add(1, Ordering::AcqRel);
                    inner.addr = Some(addr.clone());
                    let n = buf_size.min(inner.buf_size);
                    unsafe { region.copy_bufs.copy_from(buf_idx, inner.buf, n) };
                    inner.actual_size = n;
                    inner.tag = tag;
                }
                region.copy_bufs.release(buf_idx);
                Ok(Some(op))
            }
            None => {
                // No receive posted yet: hold a private copy so the
                // shared slot frees immediately.
                let mut buf = vec![0u8; buf_size];
                unsafe { region.copy_bufs.copy_from(buf_idx, buf.as_mut_ptr(), buf_size) };
                region.copy_bufs.release(buf_idx);

                let mut queue = self.unexpected_msg_queue.lock().unwrap();
                queue.push_back(UnexpectedInfo {
                    addr: addr.clone(),
                    buf,
                    tag,
                });
                Ok(None)
            }
        }
    }

    /// An expected-send header arrived: it must match a pre-posted
    /// receive on (sender, tag).
    fn process_expected(
        &self,
        addr: &Arc<Addr>,
        region: &Region,
        buf_idx: u32,
        buf_size: usize,
        tag: u32,
    ) -> Result<Arc<OpId>> {
        let op = {
            let mut queue = self.expected_op_queue.lock().unwrap();
            let pos = queue.iter().position(|op| {
                let inner = op.inner.lock().unwrap();
                inner.tag == tag
                    && inner
                        .addr
                        .as_ref()
                        .is_some_and(|a| Arc::ptr_eq(a, addr))
            });
            match pos {
                Some(pos) => {
                    let op = queue.remove(pos).unwrap();
                    op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                    op
                }
                None => {
                    region.copy_bufs.release(buf_idx);
                    return Err(Error::Protocol);
                }
            }
        };

        {
            let mut inner = op.inner.lock().unwrap();
            let n = buf_size.min(inner.buf_size);
            unsafe { region.copy_bufs.copy_from(buf_idx, inner.buf, n) };
            inner.actual_size = n;
        }
        region.copy_bufs.release(buf_idx);
        Ok(op)
    }

    /// Drain the retry queue in order. Head-of-line blocking is
    /// deliberate: it preserves per-destination submission ordering.
    fn process_retries(&self) -> Result<()> {
        loop {
            let op = self.retry_op_queue.lock().unwrap().front().cloned();
            let Some(op) = op else {
                return Ok(());
            };
            let Some(dest) = op.inner.lock().unwrap().addr.clone() else {
                // Should not happen; drop the stray entry.
                self.remove_from_retry(&op);
                continue;
            };

            if !dest.has_status(ADDR_RESOLVED) {
                match self.addr_resolve(&dest) {
                    Ok(()) => {}
                    Err(Error::Again) => return Ok(()),
                    Err(e) => {
                        self.remove_from_retry(&op);
                        self.complete_op(&op, Err(e), false);
                        continue;
                    }
                }
            }

            let buf_idx = {
                let res = dest.res.lock().unwrap();
                res.region.get().and_then(|r| r.copy_bufs.reserve())
            };
            let Some(buf_idx) = buf_idx else {
                return Ok(());
            };

            {
                let mut queue = self.retry_op_queue.lock().unwrap();
                if op.has_status(OP_CANCELED) {
                    // cancel() owns the dequeue and the completion.
                    drop(queue);
                    let res = dest.res.lock().unwrap();
                    if let Some(region) = res.region.get() {
                        region.copy_bufs.release(buf_idx);
                    }
                    continue;
                }
                if let Some(pos) = queue.iter().position(|o| Arc::ptr_eq(o, &op)) {
                    queue.remove(pos);
                }
                op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
            }

            tracing::debug!("retrying parked operation");
            match self.finish_send(&op, &dest, buf_idx) {
                Ok(()) => self.complete_op(&op, Ok(()), false),
                Err(e) => self.complete_op(&op, Err(e), false),
            }
        }
    }

    fn remove_from_retry(&self, op: &Arc<OpId>) {
        let mut queue = self.retry_op_queue.lock().unwrap();
        if let Some(pos) = queue.iter().position(|o| Arc::ptr_eq(o, op)) {
            queue.remove(pos);
        }
        op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // RMA
    // ------------------------------------------------------------------

    /// One-sided put: write `length` bytes from the local window into the
    /// remote window of `addr`'s process. Synchronous on the initiator;
    /// the callback runs before return.
    ///
    /// # Safety
    ///
    /// The local handle's segments must be valid readable memory.
    pub unsafe fn put(
        &self,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Arc<Addr>,
        op: &Arc<OpId>,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<()> {
        if !remote.flags().contains(MemAccess::WRITE) {
            return Err(Error::Permission);
        }
        self.rma(
            OpKind::Put,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            addr,
            op,
            Box::new(callback),
        )
    }

    /// One-sided get: read `length` bytes from the remote window into the
    /// local window. Synchronous on the initiator.
    ///
    /// # Safety
    ///
    /// The local handle's segments must be valid writable memory.
    pub unsafe fn get(
        &self,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Arc<Addr>,
        op: &Arc<OpId>,
        callback: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<()> {
        if !remote.flags().contains(MemAccess::READ) {
            return Err(Error::Permission);
        }
        self.rma(
            OpKind::Get,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            addr,
            op,
            Box::new(callback),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn rma(
        &self,
        kind: OpKind,
        local: &MemHandle,
        local_offset: u64,
        remote: &MemHandle,
        remote_offset: u64,
        length: u64,
        addr: &Arc<Addr>,
        op: &Arc<OpId>,
        callback: CompletionCallback,
    ) -> Result<()> {
        self.claim_op(op)?;

        addr.ref_count.fetch_add(1, Ordering::AcqRel);
        {
            let mut inner = op.inner.lock().unwrap();
            inner.kind = kind;
            inner.callback = Some(callback);
            inner.buf = std::ptr::null_mut();
            inner.buf_size = length as usize;
            inner.actual_size = 0;
            inner.tag = 0;
            inner.addr = Some(addr.clone());
        }

        let result = (|| -> Result<()> {
            let local_iov = translate_window(local, local_offset, length)?;
            let remote_iov = translate_window(remote, remote_offset, length)?;

            let n = match kind {
                OpKind::Put => unsafe { vm_write(addr.pid(), &local_iov, &remote_iov)? },
                OpKind::Get => unsafe { vm_read(addr.pid(), &local_iov, &remote_iov)? },
                _ => return Err(Error::InvalidArg),
            };
            if n as u64 != length {
                return Err(Error::MsgSize);
            }
            op.inner.lock().unwrap().actual_size = n;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.complete_op(op, Ok(()), true);
                Ok(())
            }
            Err(e) => {
                self.fail_op(op);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Request cancellation of `op`.
    ///
    /// Completed operations are unaffected (the cancel raced and lost).
    /// A parked operation is pulled off its queue and completed with a
    /// canceled result. RMA operations are synchronous and cannot be
    /// canceled.
    pub fn cancel(&self, op: &Arc<OpId>) -> Result<()> {
        let prev = op.status.fetch_or(OP_CANCELED, Ordering::AcqRel);
        if prev & OP_COMPLETED != 0 {
            return Ok(());
        }
        tracing::debug!("canceling operation");

        let kind = op.inner.lock().unwrap().kind;
        let queue = match kind {
            OpKind::RecvUnexpected => &self.unexpected_op_queue,
            OpKind::RecvExpected => &self.expected_op_queue,
            OpKind::SendUnexpected | OpKind::SendExpected => &self.retry_op_queue,
            OpKind::Put | OpKind::Get => return Ok(()),
        };

        let dequeued = {
            let mut queue = queue.lock().unwrap();
            if op.has_status(OP_QUEUED) {
                if let Some(pos) = queue.iter().position(|o| Arc::ptr_eq(o, op)) {
                    queue.remove(pos);
                    op.status.fetch_and(!OP_QUEUED, Ordering::AcqRel);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if dequeued {
            self.complete_op(op, Ok(()), true);
        }
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_impl() {
                tracing::warn!(error = %e, "endpoint dropped with work outstanding");
            }
        }
    }
}

fn login_name() -> Result<String> {
    let uid = nix::unistd::Uid::effective();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(Error::from)?
        .ok_or(Error::NoEntry)?;
    Ok(user.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_non_listener() {
        let ep = Endpoint::open(Config::new()).unwrap();
        assert!(!ep.listening());
        assert_eq!(ep.max_msg_size(), MAX_MSG_SIZE);
        assert!(ep.open_fd_count() > 0);
        ep.close().unwrap();
    }

    #[test]
    fn open_close_listener_leaves_no_files() {
        let ep = Endpoint::open(Config::new().with_listen(true)).unwrap();
        let (pid, id) = {
            let addr = ep.self_addr();
            let out = (addr.pid(), addr.id());
            ep.addr_free(&addr).unwrap();
            out
        };
        let user = login_name().unwrap();
        let sock = crate::sock::sock_path(&user, pid, id);
        let shm = std::path::PathBuf::from("/dev/shm")
            .join(crate::region::shm_name(&user, pid, id));
        assert!(sock.exists());
        assert!(shm.exists());

        ep.close().unwrap();
        assert!(!sock.exists());
        assert!(!shm.exists());
    }

    #[test]
    fn no_wait_mode_has_no_sock_or_pollset() {
        let ep = Endpoint::open(Config::new().with_listen(true).with_no_wait(true)).unwrap();
        assert_eq!(ep.open_fd_count(), 0);
        ep.close().unwrap();
    }

    #[test]
    fn lookup_is_cached_and_refcounted() {
        let ep = Endpoint::open(Config::new()).unwrap();
        let a = ep.addr_lookup("sm://4242/0").unwrap();
        let b = ep.addr_lookup("sm://4242/0").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let mut buf = [0u8; crate::addr::SERIALIZED_LEN];
        ep.addr_serialize(&a, &mut buf).unwrap();
        let c = ep.addr_deserialize(&buf).unwrap();
        assert!(Arc::ptr_eq(&a, &c));

        ep.addr_free(&c).unwrap();
        ep.addr_free(&b).unwrap();
        ep.addr_free(&a).unwrap();
        // Last free dropped the map entry.
        assert!(ep.addr_deserialize(&buf).is_err());
        ep.close().unwrap();
    }
}
