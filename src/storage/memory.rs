//! Reusable fixed-size memory buffers backing cached pages.
//!
//! Every page image in the caches lives in a [`PageBuffer`] acquired from a
//! [`ByteBufferPool`]. Dropping the buffer hands its memory back to the pool,
//! so steady-state page traffic does not allocate.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Pool of equally sized byte buffers.
pub struct ByteBufferPool {
    buffer_size: usize,
    /// Upper bound on buffers kept for reuse; extra buffers are freed.
    max_pooled: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    allocated: AtomicUsize,
    reused: AtomicU64,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub allocated: usize,
    pub pooled: usize,
    pub reused: u64,
}

impl ByteBufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_pooled,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            reused: AtomicU64::new(0),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer from the pool, allocating when none is free. Recycled
    /// buffers keep their previous contents unless `clear` is set.
    pub fn acquire(self: &Arc<Self>, clear: bool) -> PageBuffer {
        let recycled = self.free.lock().pop();
        let data = match recycled {
            Some(mut data) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                if clear {
                    data.fill(0);
                }
                data
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };
        PageBuffer {
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    /// Acquire a buffer holding a copy of `source`.
    pub fn acquire_copy(self: &Arc<Self>, source: &[u8]) -> PageBuffer {
        let mut buffer = self.acquire(false);
        buffer.copy_from_slice(source);
        buffer
    }

    fn release(&self, data: Box<[u8]>) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(data);
        } else {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            pooled: self.free.lock().len(),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ByteBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusively owned buffer; returns to its pool on drop.
pub struct PageBuffer {
    data: Option<Box<[u8]>>,
    pool: Arc<ByteBufferPool>,
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}
