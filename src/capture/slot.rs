//! Single-slot latest-frame exchange

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::trace;

use super::frame::RawFrame;

/// Holds at most one unclaimed frame.
///
/// A producer that outpaces its consumer overwrites the parked frame; the
/// displaced frame is released immediately. The consumer always claims the
/// most recent arrival.
pub struct FrameSlot {
    ring: Mutex<HeapRb<RawFrame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(1)),
        }
    }

    /// Park a frame, returning true if an older unclaimed frame was replaced
    pub fn offer(&self, frame: RawFrame) -> bool {
        let displaced = {
            let mut ring = self.ring.lock();
            let displaced = if ring.is_full() { ring.try_pop() } else { None };
            // Capacity is one and we just made room
            if let Err(frame) = ring.try_push(frame) {
                drop(frame);
            }
            displaced
        };

        match displaced {
            Some(old) => {
                trace!(timestamp = old.timestamp(), "Replacing unclaimed frame");
                old.release();
                true
            }
            None => false,
        }
    }

    /// Claim the parked frame, leaving the slot empty
    pub fn take(&self) -> Option<RawFrame> {
        self.ring.lock().try_pop()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Release any parked frame
    pub fn clear(&self) {
        let parked = self.ring.lock().try_pop();
        if let Some(frame) = parked {
            frame.release();
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, Plane};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame(ts: i64, released: &Arc<AtomicUsize>) -> RawFrame {
        let r = released.clone();
        RawFrame::new(
            2,
            2,
            PixelFormat::Nv21,
            Plane::new(vec![0u8; 4], 2),
            Plane::new(vec![0u8; 2], 2),
            ts,
        )
        .unwrap()
        .with_release(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn keeps_latest_frame() {
        let released = Arc::new(AtomicUsize::new(0));
        let slot = FrameSlot::new();

        assert!(!slot.offer(frame(1, &released)));
        assert!(slot.offer(frame(2, &released)));
        assert!(slot.offer(frame(3, &released)));
        assert_eq!(released.load(Ordering::SeqCst), 2);

        let latest = slot.take().unwrap();
        assert_eq!(latest.timestamp(), 3);
        assert!(slot.is_empty());
        assert!(slot.take().is_none());
    }

    #[test]
    fn clear_releases_parked_frame() {
        let released = Arc::new(AtomicUsize::new(0));
        let slot = FrameSlot::new();
        slot.offer(frame(1, &released));
        slot.clear();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(slot.is_empty());
    }
}
