//! Fixed-size frame buffer pool
//!
//! The pool is the only structure touched directly from transport
//! completion threads, so it carries its own lock. A [`FrameBuffer`] keeps
//! its pool alive and hands its storage back when dropped, which makes the
//! last holder of a frame the one that recycles it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    buffer_size: usize,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool of `count` buffers of `buffer_size` bytes, allocated up front
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let free = (0..count).map(|_| Vec::with_capacity(buffer_size)).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity: count,
                buffer_size,
            }),
        }
    }

    /// Take a free buffer, or `None` if every buffer is held
    pub fn acquire(&self) -> Option<FrameBuffer> {
        let storage = self.inner.lock().pop()?;
        Some(FrameBuffer {
            storage,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Buffers currently free
    pub fn available(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

/// Buffer on loan from a [`FramePool`]
pub struct FrameBuffer {
    storage: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl FrameBuffer {
    /// Replace the contents with `data`, truncated to the buffer size
    ///
    /// Returns the number of bytes kept.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.pool.buffer_size);
        self.storage.clear();
        self.storage.extend_from_slice(&data[..len]);
        len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        let mut storage = std::mem::take(&mut self.storage);
        storage.clear();
        let mut free = self.pool.lock();
        free.push(storage);
        trace!("Frame buffer returned ({} free)", free.len());
    }
}
