//! Few-permit semaphore gating producer callbacks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// Bounds the frames in flight between a producer callback and the worker.
///
/// Acquisition never blocks: a producer that gets no permit releases its
/// frame and returns.
pub struct Permits {
    available: CachePadded<AtomicUsize>,
    capacity: usize,
}

/// Returned to the pool on drop
pub struct Permit {
    permits: Arc<Permits>,
}

impl Permits {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            available: CachePadded::new(AtomicUsize::new(capacity)),
            capacity,
        })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|_| Permit {
                permits: Arc::clone(self),
            })
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.permits.available.fetch_add(1, Ordering::AcqRel);
    }
}
