//! Zero-shutter-lag ring buffer.
//!
//! Images and capture results arrive on different callback threads in no
//! particular order. Both are filed under their sensor timestamp; once
//! both halves of a timestamp are present the entry is complete and can
//! serve a shutter press.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::capture::{CaptureMetadata, RawFrame};
use crate::context::PipelineContext;
use crate::error::{Error, Result};

/// A timestamp-matched image and capture result
#[derive(Debug)]
pub struct RingEntry {
    pub frame: RawFrame,
    pub metadata: CaptureMetadata,
}

impl RingEntry {
    pub fn timestamp(&self) -> i64 {
        self.metadata.timestamp
    }
}

/// Receives entries that resolve a pending picture request
pub trait ZslListener: Send + Sync {
    fn on_matching_item_available(&self, entry: RingEntry);
}

impl ZslListener for flume::Sender<RingEntry> {
    fn on_matching_item_available(&self, entry: RingEntry) {
        // A dropped receiver releases the frame with the entry
        let _ = self.send(entry);
    }
}

#[derive(Default)]
struct Bucket {
    frame: Option<RawFrame>,
    metadata: Option<CaptureMetadata>,
}

impl Bucket {
    fn is_complete(&self) -> bool {
        self.frame.is_some() && self.metadata.is_some()
    }

    fn eligible(&self) -> bool {
        self.is_complete() && self.metadata.as_ref().is_some_and(|m| !m.flash_required())
    }

    fn into_entry(self) -> Option<RingEntry> {
        Some(RingEntry {
            frame: self.frame?,
            metadata: self.metadata?,
        })
    }
}

struct Inner {
    buckets: BTreeMap<i64, Bucket>,
    pending_request: bool,
    closed: bool,
}

/// Frames released once the lock is dropped
type Released = Vec<RawFrame>;

impl Inner {
    /// Evict oldest complete entries while over capacity, then the oldest
    /// incomplete ones while over the pending cap. `keep` is the entry just
    /// touched and is never evicted.
    fn evict(&mut self, keep: i64, capacity: usize, max_pending: usize) -> (Released, usize) {
        let mut released = Vec::new();
        let mut evicted = 0;

        while self.buckets.len() > capacity {
            let oldest_complete = self
                .buckets
                .iter()
                .find(|(ts, b)| **ts != keep && b.is_complete())
                .map(|(ts, _)| *ts);
            let Some(ts) = oldest_complete else {
                // Only incomplete entries left; keep them
                break;
            };
            if let Some(frame) = self.buckets.remove(&ts).and_then(|b| b.frame) {
                released.push(frame);
            }
            evicted += 1;
        }

        loop {
            let mut incomplete = self
                .buckets
                .iter()
                .filter(|(ts, b)| **ts != keep && !b.is_complete())
                .map(|(ts, _)| *ts);
            let count = incomplete.clone().count();
            if count <= max_pending {
                break;
            }
            let Some(ts) = incomplete.next() else {
                break;
            };
            if let Some(frame) = self.buckets.remove(&ts).and_then(|b| b.frame) {
                released.push(frame);
            }
            evicted += 1;
        }

        (released, evicted)
    }

    /// Hand the entry at `ts` to a pending request if it is the newest
    /// complete entry and does not need flash.
    fn resolve_request(&mut self, ts: i64) -> Option<RingEntry> {
        if !self.pending_request {
            return None;
        }
        let newest_complete = self
            .buckets
            .iter()
            .rev()
            .find(|(_, b)| b.is_complete())
            .map(|(ts, _)| *ts);
        if newest_complete != Some(ts) || !self.buckets.get(&ts)?.eligible() {
            return None;
        }

        self.pending_request = false;
        self.buckets.remove(&ts)?.into_entry()
    }

    fn take_best_match(&mut self) -> Option<RingEntry> {
        let ts = self
            .buckets
            .iter()
            .rev()
            .find(|(_, b)| b.eligible())
            .map(|(ts, _)| *ts)?;
        self.buckets.remove(&ts)?.into_entry()
    }
}

/// Fixed-capacity buffer of (image, metadata) pairs keyed by timestamp.
pub struct ZslRingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Incomplete entries kept at most, besides the one being filled
    max_pending: usize,
    listener: Arc<dyn ZslListener>,
    context: Arc<PipelineContext>,
}

impl ZslRingBuffer {
    pub fn new(context: Arc<PipelineContext>, listener: Arc<dyn ZslListener>) -> Self {
        let config = context.config();
        Self {
            inner: Mutex::new(Inner {
                buckets: BTreeMap::new(),
                pending_request: false,
                closed: false,
            }),
            capacity: config.zsl.capacity.max(1),
            max_pending: config.zsl.max_pending.max(1),
            listener,
            context,
        }
    }

    pub fn add_image(&self, frame: RawFrame) {
        let ts = frame.timestamp();
        self.insert(ts, |bucket| bucket.frame.replace(frame), "image");
    }

    pub fn add_metadata(&self, metadata: CaptureMetadata) {
        let ts = metadata.timestamp;
        self.insert(
            ts,
            |bucket| {
                bucket.metadata = Some(metadata);
                None
            },
            "metadata",
        );
    }

    fn insert(&self, ts: i64, fill: impl FnOnce(&mut Bucket) -> Option<RawFrame>, kind: &'static str) {
        let (mut released, resolved) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                let mut orphan = Bucket::default();
                let replaced = fill(&mut orphan);
                drop(inner);
                trace!(ts, kind, "ZSL buffer closed, dropping");
                drop(replaced);
                drop(orphan);
                return;
            }

            let bucket = inner.buckets.entry(ts).or_default();
            let replaced = fill(bucket);
            let complete = bucket.is_complete();

            let (mut released, evicted) = inner.evict(ts, self.capacity, self.max_pending);
            released.extend(replaced);
            for _ in 0..evicted {
                self.context.zsl_evicted();
            }

            let resolved = if complete { inner.resolve_request(ts) } else { None };
            trace!(ts, kind, complete, entries = inner.buckets.len(), "ZSL insert");
            (released, resolved)
        };

        for frame in released.drain(..) {
            frame.release();
        }
        if let Some(entry) = resolved {
            debug!(ts, "Pending picture request resolved");
            self.context.zsl_matched();
            self.listener.on_matching_item_available(entry);
        }
    }

    /// Take the newest complete entry that does not require flash
    pub fn try_to_get_matching_item(&self) -> Option<RingEntry> {
        let entry = self.inner.lock().take_best_match();
        if let Some(entry) = &entry {
            debug!(ts = entry.timestamp(), "ZSL match");
            self.context.zsl_matched();
        }
        entry
    }

    /// Register a request to be served by the next eligible entry.
    ///
    /// A second request while one is pending is rejected rather than
    /// replacing the first.
    pub fn add_picture_request(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::NotOpen);
        }
        if inner.pending_request {
            return Err(Error::PictureRequestPending);
        }
        inner.pending_request = true;
        debug!("Picture request registered");
        Ok(())
    }

    /// Serve from the buffer if possible, otherwise register a request.
    /// The check and registration happen under one lock, so an entry that
    /// completes concurrently cannot be missed.
    pub fn request_picture(&self) -> Result<Option<RingEntry>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::NotOpen);
        }
        if inner.pending_request {
            return Err(Error::PictureRequestPending);
        }
        if let Some(entry) = inner.take_best_match() {
            drop(inner);
            self.context.zsl_matched();
            return Ok(Some(entry));
        }
        inner.pending_request = true;
        Ok(None)
    }

    /// Drop a pending request; returns whether one was pending
    pub fn cancel_picture_request(&self) -> bool {
        std::mem::take(&mut self.inner.lock().pending_request)
    }

    pub fn has_pending_request(&self) -> bool {
        self.inner.lock().pending_request
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn complete_len(&self) -> usize {
        self.inner.lock().buckets.values().filter(|b| b.is_complete()).count()
    }

    /// Entries still waiting for their image or metadata
    pub fn pending_len(&self) -> usize {
        self.inner.lock().buckets.values().filter(|b| !b.is_complete()).count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Release every buffered frame and drop any pending request, leaving
    /// the buffer open. Returns the number of entries discarded.
    pub fn clear(&self) -> usize {
        let buckets = {
            let mut inner = self.inner.lock();
            inner.pending_request = false;
            std::mem::take(&mut inner.buckets)
        };
        let count = buckets.len();
        for (_, bucket) in buckets {
            if let Some(frame) = bucket.frame {
                frame.release();
            }
        }
        count
    }

    /// Release every buffered frame and clear the pending request. Inserts
    /// racing with or following the close release their frame immediately.
    pub fn on_close(&self) {
        let buckets = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending_request = false;
            std::mem::take(&mut inner.buckets)
        };

        let count = buckets.len();
        for (_, bucket) in buckets {
            if let Some(frame) = bucket.frame {
                frame.release();
            }
        }
        info!(released = count, "ZSL buffer closed");
    }
}
