use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_queue::ArrayQueue;

const DEFAULT_POOL_SLOTS: usize = 64;

/// Shared allocator for chunk byte storage.
///
/// Buffers handed out by [`BufferPool::acquire`] go back to the pool when
/// dropped, so a scan reuses the same few allocations chunk after chunk.
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    acquired: AtomicU64,
    reused: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_slots(DEFAULT_POOL_SLOTS)
    }

    pub fn with_slots(slots: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            free: ArrayQueue::new(slots.max(1)),
            acquired: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        })
    }

    pub fn acquire(self: &Arc<Self>, capacity: usize) -> PooledBuffer {
        self.acquired.fetch_add(1, Ordering::Relaxed);

        let data = match self.free.pop() {
            Some(mut data) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                data.clear();
                data.reserve(capacity);
                data
            }
            None => Vec::with_capacity(capacity),
        };

        PooledBuffer {
            data,
            pool: Arc::downgrade(self),
        }
    }

    fn release(&self, mut data: Vec<u8>) {
        data.clear();
        // A full pool simply lets the buffer go.
        let _ = self.free.push(data);
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

/// Byte buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Weak<BufferPool>,
}

impl PooledBuffer {
    /// A buffer that is not tied to any pool.
    pub fn detached(data: Vec<u8>) -> Self {
        PooledBuffer {
            data,
            pool: Weak::new(),
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        PooledBuffer::detached(self.data.clone())
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returns_to_pool() {
        let pool = BufferPool::with_slots(2);
        {
            let mut buf = pool.acquire(128);
            buf.extend_from_slice(b"hello");
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);

        let buf = pool.acquire(16);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 128);
        assert_eq!(pool.acquired(), 2);
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn test_detached_buffer_outlives_pool() {
        let pool = BufferPool::with_slots(1);
        let buf = pool.acquire(8);
        let copy = buf.clone();
        drop(pool);
        drop(buf);
        assert!(copy.is_empty());
    }
}
