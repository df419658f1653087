//! Synthetic NV21 capture source

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::capture::frame::{AeState, CaptureMetadata, PixelFormat, Plane, RawFrame};
use crate::error::Result;

/// Generates moving-gradient frames with matching capture metadata.
///
/// Stands in for the camera session layer in the demo binary and tests.
/// Every frame it hands out counts as outstanding until released, which
/// makes buffer leaks observable.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    /// Row padding added to both planes
    padding: u32,
    sequence: u64,
    /// Nanoseconds between frames
    frame_interval: i64,
    outstanding: Arc<AtomicU64>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            padding: 0,
            sequence: 0,
            frame_interval: 33_333_333,
            outstanding: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }

    /// Timestamp the next frame will carry
    pub fn next_timestamp(&self) -> i64 {
        (self.sequence as i64 + 1) * self.frame_interval
    }

    /// Frames handed out and not yet released
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Produce the next frame and its capture result
    #[instrument(skip(self), level = "trace")]
    pub fn capture(&mut self, ae_state: AeState) -> Result<(RawFrame, CaptureMetadata)> {
        self.sequence += 1;
        let timestamp = self.sequence as i64 * self.frame_interval;

        let luma_stride = self.width + self.padding;
        let chroma_stride = self.width.div_ceil(2) * 2 + self.padding;
        let chroma_rows = self.height.div_ceil(2);
        let phase = (self.sequence % 256) as u32;

        let mut luma = vec![0u8; (luma_stride * self.height) as usize];
        for y in 0..self.height {
            for x in 0..self.width {
                luma[(y * luma_stride + x) as usize] = ((x + y + phase) & 0xff) as u8;
            }
        }

        let mut chroma = vec![128u8; (chroma_stride * chroma_rows) as usize];
        for y in 0..chroma_rows {
            for x in (0..self.width.div_ceil(2) * 2).step_by(2) {
                let i = (y * chroma_stride + x) as usize;
                chroma[i] = (128 + (x % 32)) as u8;
                chroma[i + 1] = (128 - (y % 32)) as u8;
            }
        }

        let frame = RawFrame::new(
            self.width,
            self.height,
            PixelFormat::Nv21,
            Plane::new(luma, luma_stride),
            Plane::new(chroma, chroma_stride),
            timestamp,
        )?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.outstanding.clone();
        let frame = frame.with_release(move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        });

        let metadata = CaptureMetadata::new(timestamp, ae_state).with_frame_number(self.sequence);

        debug!(sequence = self.sequence, timestamp, "Synthetic frame captured");
        Ok((frame, metadata))
    }
}
