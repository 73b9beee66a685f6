//! Bounded buffer pool shared between capture producers and the consumer.
//!
//! Buffers circulate between two FIFO sets, each behind its own lock. No path
//! holds both locks at once. Producers only ever take the free lock and
//! briefly the full lock to publish, so they never block on the consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use super::record::Buffer;

/// Default number of buffers allocated at startup.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Point-in-time occupancy of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub full: usize,
}

impl PoolStats {
    /// Buffers neither free nor full: active on a core or held by a reader.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.free + self.full)
    }
}

/// Fixed set of pre-allocated sample buffers.
pub struct SampleBufferPool {
    free: Mutex<VecDeque<Box<Buffer>>>,
    full: Mutex<VecDeque<Box<Buffer>>>,
    full_ready: Condvar,
    shutdown: AtomicBool,
    capacity: usize,
}

impl SampleBufferPool {
    /// Allocates `capacity` buffers up front.
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Box::new(Buffer::new())).collect();

        Self {
            free: Mutex::new(free),
            full: Mutex::new(VecDeque::with_capacity(capacity)),
            full_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a free buffer. Never blocks and never allocates.
    ///
    /// Returns `None` when the free set is empty or the pool is shut down.
    pub fn acquire_free(&self) -> Option<Box<Buffer>> {
        if self.is_shutdown() {
            return None;
        }
        self.free.lock().pop_front()
    }

    /// Queues a completed buffer and wakes one waiting reader.
    pub fn publish_full(&self, buffer: Box<Buffer>) {
        self.full.lock().push_back(buffer);
        self.full_ready.notify_one();
    }

    /// Clears a consumed buffer and returns it to the free set.
    pub fn release_free(&self, mut buffer: Box<Buffer>) {
        buffer.reset(0);
        self.free.lock().push_back(buffer);
    }

    /// Blocks until a completed buffer is available.
    ///
    /// Buffers still queued at shutdown are handed out first; `None` means
    /// the pool shut down and nothing remains.
    pub fn drain_full(&self) -> Option<Box<Buffer>> {
        let mut full = self.full.lock();
        loop {
            if let Some(buffer) = full.pop_front() {
                return Some(buffer);
            }
            if self.is_shutdown() {
                return None;
            }
            self.full_ready.wait(&mut full);
        }
    }

    /// Non-blocking pop from the full set.
    pub fn try_drain_full(&self) -> Option<Box<Buffer>> {
        self.full.lock().pop_front()
    }

    /// Marks the pool as shut down and wakes every blocked reader.
    pub fn shutdown(&self) {
        // Set under the full lock so a reader between its shutdown check and
        // its wait cannot miss the notification.
        let _full = self.full.lock();
        self.shutdown.store(true, Ordering::Release);
        self.full_ready.notify_all();
    }

    /// Clears the shutdown state so capture can start again.
    pub fn resume(&self) {
        self.shutdown.store(false, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free.lock().len();
        let full = self.full.lock().len();
        PoolStats {
            capacity: self.capacity,
            free,
            full,
        }
    }
}

impl Default for SampleBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}
