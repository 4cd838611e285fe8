//! Shared pool of fixed-size read blocks.
//!
//! Connections rent blocks for their input buffers and give them back when
//! the bytes are consumed or the connection is disposed. Nothing is returned
//! implicitly on drop of a block; the owner must call [`MemoryPool::give_back`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Blocks kept on the free list; anything beyond is released to the allocator.
const DEFAULT_MAX_RETAINED: usize = 1024;

struct PoolInner {
    block_size: usize,
    max_retained: usize,
    free: Mutex<Vec<BytesMut>>,
    rented: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    pub fn new(block_size: usize) -> Self {
        Self::with_retention(block_size, DEFAULT_MAX_RETAINED)
    }

    pub fn with_retention(block_size: usize, max_retained: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                block_size: block_size.max(1),
                max_retained,
                free: Mutex::new(Vec::new()),
                rented: AtomicUsize::new(0),
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Hands out an empty block with at least `block_size` capacity.
    pub fn rent(&self) -> BytesMut {
        let reused = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        self.inner.rented.fetch_add(1, Ordering::Relaxed);
        reused.unwrap_or_else(|| BytesMut::with_capacity(self.inner.block_size))
    }

    pub fn give_back(&self, mut block: BytesMut) {
        self.inner.rented.fetch_sub(1, Ordering::Relaxed);
        block.clear();
        if block.capacity() < self.inner.block_size {
            return;
        }
        let mut free = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.inner.max_retained {
            free.push(block);
        }
    }

    /// Blocks currently out on loan.
    pub fn rented(&self) -> usize {
        self.inner.rented.load(Ordering::Relaxed)
    }

    /// Blocks sitting on the free list.
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("block_size", &self.inner.block_size)
            .field("rented", &self.rented())
            .field("available", &self.available())
            .finish()
    }
}
