//! Fixed-size buffer arena for socket reads and frame writes

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Arena of preallocated buffers handed out through a free-list.
///
/// Buffers come back truncated to zero length, so a caller that needs a
/// read window resizes it and sees zeros rather than a previous payload.
pub struct BufferPool {
    slots: Vec<Mutex<Vec<u8>>>,
    free: Mutex<Vec<usize>>,
    buffer_size: usize,
    fallback_allocations: AtomicUsize,
}

/// A buffer on loan from the pool, returned on drop
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    slot: Option<usize>,
    buf: Vec<u8>,
}

impl BufferPool {
    /// Create `count` buffers of `buffer_size` bytes capacity each
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let slots = (0..count)
            .map(|_| Mutex::new(Vec::with_capacity(buffer_size)))
            .collect();

        Self {
            slots,
            free: Mutex::new((0..count).rev().collect()),
            buffer_size,
            fallback_allocations: AtomicUsize::new(0),
        }
    }

    /// Take an empty buffer; allocates a fresh one when the arena is exhausted
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let slot = self.free.lock().pop();

        let buf = match slot {
            Some(index) => std::mem::take(&mut *self.slots[index].lock()),
            None => {
                self.fallback_allocations.fetch_add(1, Ordering::Relaxed);
                trace!("Buffer arena exhausted, allocating");
                Vec::with_capacity(self.buffer_size)
            }
        };

        PooledBuffer {
            pool: self,
            slot,
            buf,
        }
    }

    /// Take a zero-filled buffer of exactly `len` bytes
    pub fn acquire_zeroed(&self, len: usize) -> PooledBuffer<'_> {
        let mut buffer = self.acquire();
        buffer.resize(len, 0);
        buffer
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.slots.len(),
            available: self.free.lock().len(),
            fallback_allocations: self.fallback_allocations.load(Ordering::Relaxed),
        }
    }

    fn release(&self, index: usize, mut buf: Vec<u8>) {
        buf.clear();
        // Oversized buffers are not kept around
        if buf.capacity() > self.buffer_size * 4 {
            buf = Vec::with_capacity(self.buffer_size);
        }
        *self.slots[index].lock() = buf;
        self.free.lock().push(index);
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.slot.take() {
            self.pool.release(index, std::mem::take(&mut self.buf));
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub fallback_allocations: usize,
}
