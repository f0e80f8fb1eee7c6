//! RMA integration tests: scatter/gather windows, permissions, handle
//! exchange.

mod common;

use common::*;
use smipc::{Config, Endpoint, Error, MemAccess, MemHandle, OpId, OpKind, Segment};

fn listener() -> Endpoint {
    Endpoint::open(Config::new().with_listen(true)).unwrap()
}

fn segment_of(buf: &[u8]) -> Segment {
    Segment {
        base: buf.as_ptr() as u64,
        len: buf.len() as u64,
    }
}

fn segment_of_mut(buf: &mut [u8]) -> Segment {
    Segment {
        base: buf.as_mut_ptr() as u64,
        len: buf.len() as u64,
    }
}

#[test]
fn put_with_scatter_gather_window() {
    let a = listener();
    let b = listener();
    let b_addr = a.addr_lookup(&addr_string(&b)).unwrap();

    // Local side: three 1000-byte segments with distinct fill patterns.
    let seg1 = vec![0x11u8; 1000];
    let seg2 = vec![0x22u8; 1000];
    let seg3 = vec![0x33u8; 1000];
    let local = MemHandle::from_segments(
        &[segment_of(&seg1), segment_of(&seg2), segment_of(&seg3)],
        MemAccess::READ,
    )
    .unwrap();

    // Remote side: one 3000-byte target, registered by B and shipped to A
    // in serialized form.
    let mut target = vec![0u8; 3000];
    let registered =
        MemHandle::from_segments(&[segment_of_mut(&mut target)], MemAccess::WRITE).unwrap();
    let mut wire = vec![0u8; registered.serialized_size()];
    registered.serialize(&mut wire).unwrap();
    let remote = MemHandle::deserialize(&wire).unwrap();

    // Skip the first 500 bytes on both sides, move 2000.
    let rec = Recorder::new();
    let op = OpId::new();
    unsafe {
        a.put(&local, 500, &remote, 500, 2000, &b_addr, &op, rec.cb())
            .unwrap();
    }
    assert!(op.is_completed(), "RMA is synchronous on the initiator");
    assert_eq!(rec.count(), 1);
    let completion = &rec.completions()[0];
    assert!(completion.result.is_ok());
    assert_eq!(completion.kind, OpKind::Put);

    assert!(target[..500].iter().all(|&b| b == 0));
    assert!(target[500..1000].iter().all(|&b| b == 0x11));
    assert!(target[1000..2000].iter().all(|&b| b == 0x22));
    assert!(target[2000..2500].iter().all(|&b| b == 0x33));
    assert!(target[2500..].iter().all(|&b| b == 0));

    a.addr_free(&b_addr).unwrap();
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn get_reads_remote_window() {
    let a = listener();
    let b = listener();
    let b_addr = a.addr_lookup(&addr_string(&b)).unwrap();

    let source: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
    let registered = MemHandle::from_segments(&[segment_of(&source)], MemAccess::READ).unwrap();

    let mut sink = vec![0u8; 1024];
    let local = MemHandle::from_segments(&[segment_of_mut(&mut sink)], MemAccess::WRITE).unwrap();

    let rec = Recorder::new();
    let op = OpId::new();
    unsafe {
        a.get(&local, 0, &registered, 1024, 1024, &b_addr, &op, rec.cb())
            .unwrap();
    }
    assert!(rec.completions()[0].result.is_ok());
    assert_eq!(&sink[..], &source[1024..]);

    a.addr_free(&b_addr).unwrap();
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn access_flags_gate_direction() {
    let a = listener();
    let b = listener();
    let b_addr = a.addr_lookup(&addr_string(&b)).unwrap();

    let data = vec![0u8; 256];
    let local = MemHandle::from_segments(&[segment_of(&data)], MemAccess::READ | MemAccess::WRITE)
        .unwrap();
    let read_only = MemHandle::from_segments(&[segment_of(&data)], MemAccess::READ).unwrap();
    let write_only = MemHandle::from_segments(&[segment_of(&data)], MemAccess::WRITE).unwrap();

    let rec = Recorder::new();
    let op = OpId::new();

    let err = unsafe { a.put(&local, 0, &read_only, 0, 256, &b_addr, &op, rec.cb()) };
    assert_eq!(err.unwrap_err(), Error::Permission);

    let err = unsafe { a.get(&local, 0, &write_only, 0, 256, &b_addr, &op, rec.cb()) };
    assert_eq!(err.unwrap_err(), Error::Permission);

    assert_eq!(rec.count(), 0);
    assert!(op.is_completed());

    a.addr_free(&b_addr).unwrap();
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn window_past_registration_is_rejected() {
    let a = listener();
    let b = listener();
    let b_addr = a.addr_lookup(&addr_string(&b)).unwrap();

    let data = vec![0u8; 256];
    let local = MemHandle::from_segments(&[segment_of(&data)], MemAccess::READ).unwrap();
    let remote = MemHandle::from_segments(&[segment_of(&data)], MemAccess::WRITE).unwrap();

    let rec = Recorder::new();
    let op = OpId::new();
    let err = unsafe { a.put(&local, 128, &remote, 0, 256, &b_addr, &op, rec.cb()) };
    assert_eq!(err.unwrap_err(), Error::InvalidArg);
    assert!(op.is_completed());

    a.addr_free(&b_addr).unwrap();
    b.close().unwrap();
    a.close().unwrap();
}

#[test]
fn cancel_of_completed_rma_is_a_no_op() {
    let a = listener();
    let b = listener();
    let b_addr = a.addr_lookup(&addr_string(&b)).unwrap();

    let src = vec![9u8; 64];
    let mut dst = vec![0u8; 64];
    let local = MemHandle::from_segments(&[segment_of(&src)], MemAccess::READ).unwrap();
    let remote = MemHandle::from_segments(&[segment_of_mut(&mut dst)], MemAccess::WRITE).unwrap();

    let rec = Recorder::new();
    let op = OpId::new();
    unsafe {
        a.put(&local, 0, &remote, 0, 64, &b_addr, &op, rec.cb())
            .unwrap();
    }
    a.cancel(&op).unwrap();
    assert_eq!(rec.count(), 1);
    assert!(rec.completions()[0].result.is_ok());
    assert_eq!(dst, src);

    a.addr_free(&b_addr).unwrap();
    b.close().unwrap();
    a.close().unwrap();
}
