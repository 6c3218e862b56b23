//! Reusable aligned buffers
//!
//! Buffers handed back through [`BufferCallback`] are zeroed and kept for the
//! next caller asking for the same capacity.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::aligned_buffer::AlignedBuffer;
use super::callback::BufferCallback;
use super::error::IoResult;

/// Pool of aligned buffers keyed by capacity
#[derive(Debug)]
pub struct BufferPool {
    alignment: usize,
    max_per_capacity: usize,
    free: Mutex<HashMap<usize, Vec<AlignedBuffer>>>,
}

impl BufferPool {
    pub fn new(alignment: usize, max_per_capacity: usize) -> Self {
        Self {
            alignment,
            max_per_capacity,
            free: Mutex::new(HashMap::new()),
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Take a zeroed buffer of at least `size` bytes
    pub fn acquire(&self, size: usize) -> IoResult<AlignedBuffer> {
        let capacity = AlignedBuffer::round_up_to(size, self.alignment);
        let reused = self
            .free
            .lock()
            .get_mut(&capacity)
            .and_then(|buffers| buffers.pop());

        match reused {
            Some(buffer) => Ok(buffer),
            None => AlignedBuffer::with_alignment(capacity, self.alignment),
        }
    }

    /// Return a buffer to the pool
    ///
    /// Buffers of a different alignment, or beyond the per-capacity limit,
    /// are freed.
    pub fn release(&self, mut buffer: AlignedBuffer) {
        if buffer.alignment() != self.alignment {
            return;
        }

        let mut free = self.free.lock();
        let slot = free.entry(buffer.capacity()).or_default();
        if slot.len() < self.max_per_capacity {
            buffer.zero();
            slot.push(buffer);
        }
    }

    /// Number of buffers currently retained
    pub fn retained(&self) -> usize {
        self.free.lock().values().map(Vec::len).sum()
    }
}

impl BufferCallback for BufferPool {
    fn buffer_done(&self, buffer: AlignedBuffer) {
        self.release(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_buffer_is_reused_zeroed() {
        let pool = BufferPool::new(512, 2);
        let mut buf = pool.acquire(100).unwrap();
        assert_eq!(buf.capacity(), 512);
        buf.fill(0xEE);
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.retained(), 1);

        let mut again = pool.acquire(512).unwrap();
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.is_empty());
        assert!(again.as_mut_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_retention_limit() {
        let pool = BufferPool::new(1, 1);
        pool.buffer_done(pool.acquire(8).unwrap());
        pool.buffer_done(pool.acquire(8).unwrap());
        pool.buffer_done(AlignedBuffer::with_alignment(8, 1).unwrap());
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn test_foreign_alignment_dropped() {
        let pool = BufferPool::new(1, 4);
        pool.release(AlignedBuffer::new(512).unwrap());
        assert_eq!(pool.retained(), 0);
    }
}
