//! Reusable packet buffers.
//!
//! Every packet the gateway writes to the interface is serialized into a [`PacketBuf`]
//! checked out of a [`BufferPool`]. The handle owns its buffer until it is released,
//! either explicitly with [`PacketBuf::release`] or by being dropped, so a buffer goes
//! back to the pool exactly once.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_queue::ArrayQueue;

/// Default number of idle buffers kept around.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Buffers start with room for one MTU-sized packet.
pub const DEFAULT_BUFFER_SIZE: usize = 1500;

/// Buffers that grew past this many bytes shrink before going back to the pool.
const MAX_RETAINED_CAPACITY: usize = 65_535;

#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// An empty buffer, reused from the pool when one is idle.
    pub fn checkout(self: &Arc<Self>) -> PacketBuf {
        let buffer = match self.buffers.pop() {
            Some(buffer) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.buffer_size)
            }
        };

        PacketBuf {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Idle buffers currently held.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    fn check_in(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        if buffer.capacity() > MAX_RETAINED_CAPACITY {
            buffer.shrink_to(self.buffer_size);
        }
        // a full pool just lets the buffer go
        let _ = self.buffers.push(buffer);
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PacketBuf {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PacketBuf {
    /// Mutable access for serializing into the buffer.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        self.buffer.get_or_insert_with(Vec::new)
    }

    /// Hands the buffer back to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PacketBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.check_in(buffer);
        }
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuf").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_reused() {
        let pool = BufferPool::new(4, 64);

        let mut buf = pool.checkout();
        buf.as_mut_vec().extend_from_slice(b"packet");
        assert_eq!(&buf[..], b"packet");
        assert_eq!(pool.available(), 0);

        buf.release();
        assert_eq!(pool.available(), 1);

        let again = pool.checkout();
        assert!(again.is_empty());
        assert_eq!(pool.reuses(), 1);
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn dropping_returns_the_buffer() {
        let pool = BufferPool::new(4, 64);
        {
            let _buf = pool.checkout();
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn full_pool_discards_extra_buffers() {
        let pool = BufferPool::new(2, 64);
        let held: Vec<_> = (0..5).map(|_| pool.checkout()).collect();
        drop(held);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocations(), 5);
    }

    #[test]
    fn oversized_buffers_shrink_on_return() {
        let pool = BufferPool::new(2, 64);
        let mut buf = pool.checkout();
        buf.as_mut_vec().resize(200_000, 0);
        buf.release();

        let reused = pool.checkout();
        assert!(reused.is_empty());
        drop(reused);
        assert_eq!(pool.available(), 1);
    }
}
