//! Capture session orchestration.
//!
//! [`PostProcessor`] owns one session at a time: a ZSL ring buffer and a
//! frame accumulator. Producer callbacks are routed to the ring while ZSL
//! is active and straight to the accumulator otherwise.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::capture::{CaptureMetadata, RawFrame};
use crate::context::{PipelineContext, PipelineMetrics};
use crate::encode::ImageEncoder;
use crate::error::{Error, Result};
use crate::filter::{FilterId, FilterRegistry};
use crate::pipeline::{
    AccumulatorStatus, CaptureListener, FrameAccumulator, RingEntry, ZslListener, ZslRingBuffer,
};

/// Feeds resolved picture requests into the accumulator
struct ZslForwarder {
    accumulator: Arc<FrameAccumulator>,
}

impl ZslListener for ZslForwarder {
    fn on_matching_item_available(&self, entry: RingEntry) {
        debug!(ts = entry.timestamp(), "Forwarding ZSL match");
        self.accumulator.on_frame_available(entry.frame);
    }
}

struct Session {
    ring: Arc<ZslRingBuffer>,
    accumulator: Arc<FrameAccumulator>,
    burst: bool,
    flash: bool,
    zsl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStatus {
    pub open: bool,
    pub zsl_active: bool,
    pub zsl_entries: usize,
    pub picture_request_pending: bool,
    pub accumulator: Option<AccumulatorStatus>,
    pub metrics: PipelineMetrics,
}

pub struct PostProcessor {
    context: Arc<PipelineContext>,
    registry: FilterRegistry,
    encoder: Arc<dyn ImageEncoder>,
    listener: Arc<dyn CaptureListener>,
    session: RwLock<Option<Session>>,
}

impl PostProcessor {
    pub fn new(
        context: Arc<PipelineContext>,
        registry: FilterRegistry,
        encoder: Arc<dyn ImageEncoder>,
        listener: Arc<dyn CaptureListener>,
    ) -> Self {
        Self {
            context,
            registry,
            encoder,
            listener,
            session: RwLock::new(None),
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// Start a capture session. An already open session is closed first.
    ///
    /// Returns the filter actually in effect.
    pub fn open(&self, filter: FilterId, burst: bool, flash: bool) -> Result<FilterId> {
        self.close();

        let accumulator = Arc::new(FrameAccumulator::new(
            self.context.clone(),
            self.registry.clone(),
            self.encoder.clone(),
            self.listener.clone(),
        )?);
        let effective = accumulator.set_filter(filter);
        let ring = Arc::new(ZslRingBuffer::new(
            self.context.clone(),
            Arc::new(ZslForwarder {
                accumulator: accumulator.clone(),
            }),
        ));
        let zsl = self.zsl_eligible(effective, burst, flash);

        info!(filter = %effective, burst, flash, zsl, "Session opened");
        *self.session.write() = Some(Session {
            ring,
            accumulator,
            burst,
            flash,
            zsl,
        });
        Ok(effective)
    }

    fn zsl_eligible(&self, filter: FilterId, burst: bool, flash: bool) -> bool {
        self.context.config().zsl.enabled && !burst && !flash && filter == FilterId::None
    }

    /// Producer callback for image buffers
    pub fn on_frame_available(&self, frame: RawFrame) {
        let session = self.session.read();
        match session.as_ref() {
            Some(s) if s.zsl => s.ring.add_image(frame),
            Some(s) => s.accumulator.on_frame_available(frame),
            None => {
                drop(session);
                debug!(ts = frame.timestamp(), "No open session, releasing frame");
                frame.release();
            }
        }
    }

    /// Producer callback for capture results
    pub fn on_metadata_available(&self, metadata: CaptureMetadata) {
        if let Some(s) = self.session.read().as_ref() {
            if s.zsl {
                s.ring.add_metadata(metadata);
            }
        }
    }

    /// Trigger a capture. With ZSL active the best buffered frame is used,
    /// or the next eligible one if none is buffered yet. Without ZSL the
    /// frames of the capture request arrive through
    /// [`PostProcessor::on_frame_available`] and nothing happens here.
    pub fn take_picture(&self) -> Result<()> {
        let (ring, accumulator) = {
            let session = self.session.read();
            let s = session.as_ref().ok_or(Error::NotOpen)?;
            if !s.zsl {
                return Ok(());
            }
            (s.ring.clone(), s.accumulator.clone())
        };

        match ring.request_picture()? {
            Some(entry) => {
                debug!(ts = entry.timestamp(), "Taking picture from ZSL buffer");
                accumulator.on_frame_available(entry.frame);
            }
            None => debug!("No eligible ZSL frame yet, request pending"),
        }
        Ok(())
    }

    /// Swap the filter and re-evaluate ZSL. Returns the filter in effect.
    pub fn set_filter(&self, filter: FilterId) -> Result<FilterId> {
        let mut session = self.session.write();
        let s = session.as_mut().ok_or(Error::NotOpen)?;

        let effective = s.accumulator.set_filter(filter);
        let zsl = self.zsl_eligible(effective, s.burst, s.flash);
        if s.zsl && !zsl {
            let discarded = s.ring.clear();
            debug!(discarded, "ZSL deactivated");
        }
        if zsl != s.zsl {
            info!(filter = %effective, zsl, "ZSL mode changed");
        }
        s.zsl = zsl;
        Ok(effective)
    }

    pub fn is_open(&self) -> bool {
        self.session.read().is_some()
    }

    pub fn status(&self) -> ProcessorStatus {
        let session = self.session.read();
        match session.as_ref() {
            Some(s) => ProcessorStatus {
                open: true,
                zsl_active: s.zsl,
                zsl_entries: s.ring.len(),
                picture_request_pending: s.ring.has_pending_request(),
                accumulator: Some(s.accumulator.status()),
                metrics: self.context.metrics(),
            },
            None => ProcessorStatus {
                open: false,
                zsl_active: false,
                zsl_entries: 0,
                picture_request_pending: false,
                accumulator: None,
                metrics: self.context.metrics(),
            },
        }
    }

    /// Close the ring, then tear the accumulator down. Idempotent.
    pub fn close(&self) {
        let Some(session) = self.session.write().take() else {
            return;
        };

        session.ring.on_close();
        session.accumulator.close();
        info!("Session closed");
    }
}

impl Drop for PostProcessor {
    fn drop(&mut self) {
        self.close();
    }
}
