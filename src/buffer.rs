//! Receive buffer pool.
//!
//! Sustained receive traffic at hundreds of packets per second would
//! otherwise allocate a fresh 9000-byte buffer per packet. The pool owns the
//! raw buffers for the life of the transport; the receive path checks one
//! out per read and hands callers a copy sized to the payload, never a slice
//! of pooled memory. Buffers are zeroed on return so no payload bytes leak
//! into a later receive.

use crate::proto::MAX_PACKET_SIZE;

pub struct BufferPool {
    free: Vec<Box<[u8]>>,
    capacity: usize,
}

impl BufferPool {
    /// A pool retaining at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> BufferPool {
        BufferPool {
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Takes a zeroed [`MAX_PACKET_SIZE`]-byte buffer out of the pool,
    /// allocating one when the pool is empty.
    pub fn checkout(&mut self) -> Box<[u8]> {
        self.free
            .pop()
            .unwrap_or_else(|| vec![0u8; MAX_PACKET_SIZE].into_boxed_slice())
    }

    /// Returns a buffer, zeroing it first. Buffers beyond the retention cap
    /// are dropped.
    pub fn restore(&mut self, mut buf: Box<[u8]>) {
        if self.free.len() >= self.capacity {
            return;
        }
        for byte in buf.iter_mut() {
            *byte = 0;
        }
        self.free.push(buf);
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.len()
    }
}
