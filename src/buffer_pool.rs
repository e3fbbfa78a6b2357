//! Pool of reusable overflow buffers for the frame reader.
//!
//! A small `ArrayQueue` of buffers leased out and returned on drop,
//! amortizing allocation churn
//! across repeated connect/close cycles rather than across individual
//! reads (one reader owns one overflow buffer for its whole lifetime; the
//! pool's job is to hand that buffer back for the *next* connection instead
//! of letting it get dropped and reallocated).

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

const POOL_CAPACITY: usize = 16;

pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buffers: ArrayQueue::new(POOL_CAPACITY),
        })
    }

    pub fn lease(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.buffers.pop().unwrap_or_default();
        PooledBuffer {
            pool: Arc::clone(self),
            buf,
        }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        let _ = self.buffers.push(buf);
    }
}

/// A leased overflow buffer, returned to the pool on drop.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(mem::take(&mut self.buf));
    }
}
