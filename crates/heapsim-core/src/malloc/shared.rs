//! Heap handle shareable across threads.
//!
//! A single `parking_lot::Mutex` serializes every operation, so concurrent
//! callers observe the same results as some sequential interleaving.

use std::sync::Arc;

use parking_lot::Mutex;

use super::allocator::{Heap, HeapError};
use super::placement::Strategy;

#[derive(Debug, Clone)]
pub struct SharedHeap {
    inner: Arc<Mutex<Heap>>,
}

impl SharedHeap {
    #[must_use]
    pub fn new(heap: Heap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(heap)),
        }
    }

    pub fn with_capacity(capacity: usize, strategy: Strategy) -> Result<Self, HeapError> {
        Ok(Self::new(Heap::new(capacity, strategy)?))
    }

    pub fn allocate(&self, size: i64) -> Result<bool, HeapError> {
        self.inner.lock().allocate(size)
    }

    pub fn release(&self, size: i64) -> Result<bool, HeapError> {
        self.inner.lock().release(size)
    }

    /// Runs `f` with exclusive access to the heap.
    pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
