//! Single-producer/single-consumer ring buffer of whole TS packets.
//!
//! The producer (ingest task) owns `write`, the consumer (pacer thread)
//! owns `read`; the shared `count` is the only cross-thread counter
//! (fetch-add on push, fetch-sub on pop). Capacity is a multiple of 188;
//! pushes beyond capacity are dropped and counted in `overflow`.
//!
//! Endpoints are `Send` but deliberately not clonable: one owner per side.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::TS_PACKET_SIZE;

struct Inner {
    buf: UnsafeCell<Box<[u8]>>,
    size: usize,
    count: AtomicUsize,
    overflow: AtomicU64,
}

// SPSC contract: the producer only writes bytes not covered by `count`,
// the consumer only reads bytes covered by it; the Release/Acquire pair
// on `count` orders the copies.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

pub struct RingProducer {
    inner: Arc<Inner>,
    write: usize,
}

pub struct RingConsumer {
    inner: Arc<Inner>,
    read: usize,
}

/// Builds a ring of `capacity` bytes rounded down to a multiple of 188.
pub fn ring(capacity: usize) -> (RingProducer, RingConsumer) {
    let size = (capacity / TS_PACKET_SIZE) * TS_PACKET_SIZE;
    assert!(size >= 2 * TS_PACKET_SIZE, "ring capacity too small");
    let inner = Arc::new(Inner {
        buf: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        size,
        count: AtomicUsize::new(0),
        overflow: AtomicU64::new(0),
    });
    (
        RingProducer {
            inner: Arc::clone(&inner),
            write: 0,
        },
        RingConsumer { inner, read: 0 },
    )
}

impl RingProducer {
    /// Copies one packet in; returns `false` (and counts the overflow)
    /// when the ring is full.
    pub fn push(&mut self, ts: &[u8]) -> bool {
        debug_assert_eq!(ts.len(), TS_PACKET_SIZE);
        let inner = &*self.inner;
        if inner.count.load(Ordering::Acquire) + TS_PACKET_SIZE > inner.size {
            inner.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            let buf = &mut *inner.buf.get();
            buf[self.write..self.write + TS_PACKET_SIZE].copy_from_slice(ts);
        }
        self.write = (self.write + TS_PACKET_SIZE) % inner.size;
        inner.count.fetch_add(TS_PACKET_SIZE, Ordering::Release);
        true
    }

    /// Packets dropped because the consumer fell behind.
    pub fn overflow(&self) -> u64 {
        self.inner.overflow.load(Ordering::Relaxed)
    }
}

impl RingConsumer {
    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.inner.size
    }

    /// Copies the packet `offset` bytes past the read cursor without
    /// consuming it. `offset` must be 188-aligned and within `len()`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> bool {
        debug_assert_eq!(offset % TS_PACKET_SIZE, 0);
        if offset + TS_PACKET_SIZE > self.len() {
            return false;
        }
        let inner = &*self.inner;
        let pos = (self.read + offset) % inner.size;
        unsafe {
            let buf = &*inner.buf.get();
            out[..TS_PACKET_SIZE].copy_from_slice(&buf[pos..pos + TS_PACKET_SIZE]);
        }
        true
    }

    /// Pops the packet at the read cursor.
    pub fn pop(&mut self, out: &mut [u8]) -> bool {
        if !self.read_at(0, out) {
            return false;
        }
        self.advance(TS_PACKET_SIZE);
        true
    }

    /// Discards `bytes` (188-aligned, at most `len()`) without emitting.
    pub fn advance(&mut self, bytes: usize) {
        debug_assert_eq!(bytes % TS_PACKET_SIZE, 0);
        debug_assert!(bytes <= self.len());
        let inner = &*self.inner;
        self.read = (self.read + bytes) % inner.size;
        inner.count.fetch_sub(bytes, Ordering::Release);
    }
}
