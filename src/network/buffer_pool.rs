use std::fmt;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Reusable outbound buffers.
///
/// Buffers are rented to pack a frame and returned once the frame has been written, whatever the outcome of the
/// write. At most `max_pooled` buffers are retained; returns beyond that are dropped.
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Creates an empty pool retaining up to `max_pooled` buffers, each allocated with `buffer_capacity` bytes.
    pub fn new(max_pooled: usize, buffer_capacity: usize) -> Self {
        BufferPool {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            buffer_capacity,
        }
    }

    /// Rents an empty buffer.
    pub fn rent(&self) -> BytesMut {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    /// Returns a buffer for reuse.
    pub fn return_buffer(&self, mut buffer: BytesMut) {
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }

    /// Returns the number of idle buffers.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(128, 4096)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("max_pooled", &self.max_pooled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn returned_buffers_are_cleared_and_reused() {
        let pool = BufferPool::new(2, 64);
        let mut buf = pool.rent();
        buf.put_slice(b"frame");
        let ptr = buf.as_ptr();

        pool.return_buffer(buf);
        assert_eq!(pool.available(), 1);

        let buf = pool.rent();
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn retention_is_bounded() {
        let pool = BufferPool::new(2, 8);
        let buffers: Vec<_> = (0..4).map(|_| pool.rent()).collect();
        for buf in buffers {
            pool.return_buffer(buf);
        }
        assert_eq!(pool.available(), 2);
    }
}
