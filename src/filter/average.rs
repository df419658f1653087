//! Multi-shot noise reduction by per-pixel averaging

use tracing::{debug, warn};

use super::{packed_planes, planes_fit, Filter, FrameExtra, ResultImage};
use crate::capture::{FrameGeometry, PixelFormat};

/// Averages luma and chroma of N aligned frames.
///
/// Assumes a static scene or a tripod; there is no registration step.
pub struct FrameAverage {
    frames: usize,
    geometry: Option<FrameGeometry>,
    luma_sum: Vec<u32>,
    chroma_sum: Vec<u32>,
    ingested: usize,
    format: PixelFormat,
}

impl FrameAverage {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: frames.max(1),
            geometry: None,
            luma_sum: Vec::new(),
            chroma_sum: Vec::new(),
            ingested: 0,
            format: PixelFormat::Nv21,
        }
    }

    fn reset_cycle(&mut self) {
        self.luma_sum.iter_mut().for_each(|v| *v = 0);
        self.chroma_sum.iter_mut().for_each(|v| *v = 0);
        self.ingested = 0;
    }
}

impl Filter for FrameAverage {
    fn name(&self) -> &'static str {
        "average"
    }

    fn required_frame_count(&self) -> usize {
        self.frames
    }

    fn init(&mut self, geometry: FrameGeometry) {
        self.luma_sum = vec![0; (geometry.width * geometry.height) as usize];
        self.chroma_sum = vec![0; (geometry.chroma_row_bytes() * geometry.chroma_rows()) as usize];
        self.geometry = Some(geometry);
        self.ingested = 0;
        debug!(?geometry, frames = self.frames, "Average filter primed");
    }

    fn add_frame(&mut self, luma: &[u8], chroma: &[u8], index: usize, extra: &FrameExtra) {
        let Some(geometry) = self.geometry else {
            warn!(index, "Frame added before init");
            return;
        };
        if !planes_fit(luma, chroma, &geometry) {
            warn!(index, "Frame planes do not match primed geometry");
            return;
        }
        if self.ingested >= self.frames {
            return;
        }

        let (y, c) = packed_planes(luma, chroma, &geometry);
        for (sum, px) in self.luma_sum.iter_mut().zip(&y) {
            *sum += *px as u32;
        }
        for (sum, px) in self.chroma_sum.iter_mut().zip(&c) {
            *sum += *px as u32;
        }
        self.format = extra.format;
        self.ingested += 1;
    }

    fn finalize(&mut self) -> Option<ResultImage> {
        let geometry = self.geometry?;
        if self.ingested < self.frames {
            debug!(
                ingested = self.ingested,
                required = self.frames,
                "Average finalized early"
            );
            self.reset_cycle();
            return None;
        }

        let n = self.ingested as u32;
        let round = n / 2;
        let luma: Vec<u8> = self.luma_sum.iter().map(|s| ((s + round) / n) as u8).collect();
        let chroma: Vec<u8> = self.chroma_sum.iter().map(|s| ((s + round) / n) as u8).collect();
        self.reset_cycle();

        Some(ResultImage::packed(
            luma,
            &chroma,
            geometry.width,
            geometry.height,
            self.format,
        ))
    }

    fn deinit(&mut self) {
        self.geometry = None;
        self.luma_sum = Vec::new();
        self.chroma_sum = Vec::new();
        self.ingested = 0;
    }
}
