//! Best-of-burst selection by luma sharpness

use tracing::{debug, warn};

use super::{packed_planes, planes_fit, Filter, FrameExtra, ResultImage};
use crate::capture::{FrameGeometry, PixelFormat};

/// Keeps the frame with the highest gradient energy.
pub struct BestShot {
    frames: usize,
    geometry: Option<FrameGeometry>,
    best: Option<Candidate>,
    ingested: usize,
}

struct Candidate {
    score: u64,
    index: usize,
    luma: Vec<u8>,
    chroma: Vec<u8>,
    format: PixelFormat,
}

impl BestShot {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: frames.max(1),
            geometry: None,
            best: None,
            ingested: 0,
        }
    }
}

/// Sum of absolute horizontal and vertical luma differences
fn sharpness(luma: &[u8], width: usize, height: usize) -> u64 {
    let mut score = 0u64;
    for y in 0..height {
        let row = &luma[y * width..(y + 1) * width];
        for x in 1..width {
            score += row[x].abs_diff(row[x - 1]) as u64;
        }
        if y > 0 {
            let prev = &luma[(y - 1) * width..y * width];
            score += row
                .iter()
                .zip(prev)
                .map(|(a, b)| a.abs_diff(*b) as u64)
                .sum::<u64>();
        }
    }
    score
}

impl Filter for BestShot {
    fn name(&self) -> &'static str {
        "bestshot"
    }

    fn required_frame_count(&self) -> usize {
        self.frames
    }

    fn init(&mut self, geometry: FrameGeometry) {
        self.geometry = Some(geometry);
        self.best = None;
        self.ingested = 0;
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

        let (y, c) = packed_planes(luma, chroma, &geometry);
        let score = sharpness(&y, geometry.width as usize, geometry.height as usize);
        self.ingested += 1;

        if self.best.as_ref().map_or(true, |best| score > best.score) {
            debug!(index, score, "New sharpest frame");
            self.best = Some(Candidate {
                score,
                index,
                luma: y,
                chroma: c,
                format: extra.format,
            });
        }
    }

    fn finalize(&mut self) -> Option<ResultImage> {
        let geometry = self.geometry?;
        let best = self.best.take();
        let ingested = std::mem::take(&mut self.ingested);
        if ingested < self.frames {
            return None;
        }

        let best = best?;
        debug!(index = best.index, score = best.score, "Best shot selected");
        Some(ResultImage::packed(
            best.luma,
            &best.chroma,
            geometry.width,
            geometry.height,
            best.format,
        ))
    }

    fn deinit(&mut self) {
        self.geometry = None;
        self.best = None;
        self.ingested = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY: FrameGeometry = FrameGeometry {
        width: 4,
        height: 4,
        luma_stride: 4,
        chroma_stride: 4,
    };

    fn extra() -> FrameExtra {
        FrameExtra {
            timestamp: 0,
            orientation: 0,
            format: PixelFormat::Nv21,
        }
    }

    #[test]
    fn flat_image_has_zero_sharpness() {
        assert_eq!(sharpness(&[7; 16], 4, 4), 0);
    }

    #[test]
    fn selects_highest_contrast_frame() {
        let mut filter = BestShot::new(3);
        filter.init(GEOMETRY);

        let flat = vec![100u8; 16];
        let edges: Vec<u8> = (0..16).map(|i| if i % 2 == 0 { 0 } else { 255 }).collect();
        let soft: Vec<u8> = (0..16).map(|i| (i * 4) as u8).collect();
        let chroma = vec![128u8; 8];

        filter.add_frame(&flat, &chroma, 0, &extra());
        filter.add_frame(&edges, &chroma, 1, &extra());
        filter.add_frame(&soft, &chroma, 2, &extra());

        let result = filter.finalize().unwrap();
        assert_eq!(result.luma(), edges.as_slice());
    }

    #[test]
    fn early_finalize_returns_none() {
        let mut filter = BestShot::new(2);
        filter.init(GEOMETRY);
        filter.add_frame(&[1; 16], &[128; 8], 0, &extra());
        assert!(filter.finalize().is_none());
    }
}
