//! Circular byte allocator for packing access units into a shared region
//! smaller than their total size.
//!
//! The feeder writes at `write_index`; the completion dispatcher reclaims
//! space by advancing `read_index` as the device reports bytes consumed.
//! That advance is the only path by which space comes back, so a full ring
//! is backpressure for the feeder, never data loss.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::trace;

use crate::error::{CodecError, Result};

/// Result of a ring write: where the payload landed and how much of it fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSlot {
    /// Byte offset of the written payload within the ring region.
    pub offset: usize,
    /// Bytes actually written; less than the payload length when free space
    /// ran short (the caller decides whether partial submission is
    /// acceptable).
    pub written: usize,
}

/// Fixed-capacity circular byte buffer.
///
/// `is_empty` and `is_full` are mutually exclusive; both are false while
/// partially filled. Space must be reserved by the write itself - a write
/// never clobbers unconsumed bytes.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
    empty: bool,
    full: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            data: vec![0u8; capacity],
            read_index: 0,
            write_index: 0,
            empty: true,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Bytes available for writing.
    pub fn free_space(&self) -> usize {
        if self.full {
            0
        } else if self.empty {
            self.capacity()
        } else if self.write_index < self.read_index {
            self.read_index - self.write_index
        } else {
            self.capacity() - self.write_index + self.read_index
        }
    }

    /// Bytes written but not yet reclaimed.
    pub fn occupied(&self) -> usize {
        self.capacity() - self.free_space()
    }

    /// Write as much of `payload` as fits at `write_index`, wrapping at
    /// capacity. Fails with [`CodecError::RingFull`] when no space is free;
    /// a partial write is reported through [`RingSlot::written`].
    pub fn write(&mut self, payload: &[u8]) -> Result<RingSlot> {
        let offset = self.write_index;
        if payload.is_empty() {
            return Ok(RingSlot { offset, written: 0 });
        }
        if self.full {
            return Err(CodecError::RingFull);
        }
        let n = payload.len().min(self.free_space());
        let cap = self.capacity();
        let first = n.min(cap - self.write_index);
        self.data[self.write_index..self.write_index + first].copy_from_slice(&payload[..first]);
        if first < n {
            self.data[..n - first].copy_from_slice(&payload[first..n]);
        }
        self.write_index = (self.write_index + n) % cap;
        self.empty = false;
        if self.write_index == self.read_index {
            self.full = true;
        }
        trace!(offset, written = n, requested = payload.len(), "ring write");
        Ok(RingSlot { offset, written: n })
    }

    /// Reclaim `consumed` bytes starting at `read_index`, as released by the
    /// device. Consuming more than is occupied is an accounting error.
    pub fn advance_read(&mut self, consumed: usize) -> Result<()> {
        if consumed == 0 {
            return Ok(());
        }
        let occupied = self.occupied();
        if consumed > occupied {
            return Err(CodecError::RingUnderflow {
                requested: consumed,
                occupied,
            });
        }
        self.read_index = (self.read_index + consumed) % self.capacity();
        self.full = false;
        if self.read_index == self.write_index {
            self.empty = true;
        }
        trace!(consumed, read_index = self.read_index, "ring advance");
        Ok(())
    }

    /// Copy `len` bytes starting at `offset`, wrapping at capacity. This is
    /// the device-facing view of a submitted `(offset, len)` range; it does
    /// not change any accounting.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.data[(offset + i) % self.capacity()])
            .collect()
    }
}

/// Ring shared between the feeder (writer) and the dispatcher (reclaimer),
/// with a condvar so the feeder can block for freed space.
pub struct SharedRing {
    inner: Mutex<RingBuffer>,
    space_freed: Condvar,
}

impl SharedRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingBuffer::new(capacity)),
            space_freed: Condvar::new(),
        }
    }

    pub fn write(&self, payload: &[u8]) -> Result<RingSlot> {
        self.inner.lock().unwrap().write(payload)
    }

    /// Read a submitted `(offset, len)` range, as a device implementation
    /// does when consuming a ring-backed buffer.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.inner.lock().unwrap().read_at(offset, len)
    }

    /// Reclaim space and wake any feeder blocked in [`wait_for_space`].
    ///
    /// [`wait_for_space`]: SharedRing::wait_for_space
    pub fn advance_read(&self, consumed: usize) -> Result<()> {
        let result = self.inner.lock().unwrap().advance_read(consumed);
        if result.is_ok() {
            self.space_freed.notify_all();
        }
        result
    }

    /// Block until some space is free or `timeout` elapses. Returns `false`
    /// on timeout.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock().unwrap();
        let (guard, result) = self
            .space_freed
            .wait_timeout_while(guard, timeout, |ring| ring.free_space() == 0)
            .unwrap();
        drop(guard);
        !result.timed_out()
    }
}
