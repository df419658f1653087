//! Multi-frame filter contract and registry.
//!
//! A filter consumes [`Filter::required_frame_count`] frames and produces a
//! single [`ResultImage`]. The accumulator only drives the contract; the
//! numeric work belongs to the filter implementation, which may wrap a
//! native library. [`FilterRegistry`] maps the fixed [`FilterId`]
//! enumeration to factories.

pub mod average;
pub mod best_shot;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::plane_min_len;
use crate::capture::{FrameGeometry, PixelFormat};
use crate::FilterConfig;

pub use average::FrameAverage;
pub use best_shot::BestShot;

/// Per-frame side information passed with each ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameExtra {
    pub timestamp: i64,
    pub orientation: u32,
    pub format: PixelFormat,
}

/// A multi-frame computational photography algorithm.
///
/// Calls arrive on the accumulator worker thread in this order:
/// `init`, `add_frame` × N, `finalize`, then either another
/// `add_frame` cycle or `deinit`.
pub trait Filter: Send {
    fn name(&self) -> &'static str;

    fn required_frame_count(&self) -> usize;

    /// Whether the backing implementation can run on this device
    fn is_supported(&self) -> bool {
        true
    }

    fn init(&mut self, geometry: FrameGeometry);

    /// Ingest one frame. Planes are strided as described by the geometry
    /// passed to `init`.
    fn add_frame(&mut self, luma: &[u8], chroma: &[u8], index: usize, extra: &FrameExtra);

    /// Produce the result for the current cycle.
    ///
    /// Must return `None` rather than panic when fewer than the required
    /// frames were ingested. Resets per-cycle state either way.
    fn finalize(&mut self) -> Option<ResultImage>;

    fn deinit(&mut self);
}

/// Output region of interest in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }
}

/// Semi-planar output of a finalize step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultImage {
    /// Luma plane followed by the chroma plane
    pub data: Vec<u8>,
    /// Start of the chroma plane in `data`
    pub chroma_offset: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub chroma_stride: u32,
    pub roi: Roi,
    pub format: PixelFormat,
}

impl ResultImage {
    /// Tightly packed image (stride equal to width)
    pub fn packed(
        luma: Vec<u8>,
        chroma: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        let mut data = luma;
        let chroma_offset = data.len();
        data.extend_from_slice(chroma);
        let chroma_stride = width.div_ceil(2) * 2;
        Self {
            data,
            chroma_offset,
            width,
            height,
            stride: width,
            chroma_stride,
            roi: Roi::full(width, height),
            format,
        }
    }

    pub fn luma(&self) -> &[u8] {
        &self.data[..self.chroma_offset.min(self.data.len())]
    }

    pub fn chroma(&self) -> Option<&[u8]> {
        self.data.get(self.chroma_offset..)
    }
}

/// Fixed enumeration of selectable filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterId {
    None,
    /// Multi-shot noise reduction by frame averaging
    Average,
    /// Keep the sharpest frame of a burst
    BestShot,
    /// Native multi-shot sharpening
    Sharpshooter,
    /// Native focus stacking
    Ubifocus,
    /// Native multi-frame super resolution
    Optizoom,
    /// Native low-light stacking
    Stillmore,
}

impl FilterId {
    pub const ALL: [FilterId; 7] = [
        FilterId::None,
        FilterId::Average,
        FilterId::BestShot,
        FilterId::Sharpshooter,
        FilterId::Ubifocus,
        FilterId::Optizoom,
        FilterId::Stillmore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterId::None => "none",
            FilterId::Average => "average",
            FilterId::BestShot => "bestshot",
            FilterId::Sharpshooter => "sharpshooter",
            FilterId::Ubifocus => "ubifocus",
            FilterId::Optizoom => "optizoom",
            FilterId::Stillmore => "stillmore",
        }
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        FilterId::ALL
            .into_iter()
            .find(|id| id.as_str() == lower)
            .ok_or_else(|| format!("unknown filter: {s}"))
    }
}

pub type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;

/// Table from [`FilterId`] to filter constructors.
///
/// Ids without a registered factory resolve to nothing and are treated as
/// unsupported by the accumulator.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    factories: HashMap<FilterId, FilterFactory>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the in-crate reference filters
    pub fn with_builtin(config: &FilterConfig) -> Self {
        let mut registry = Self::empty();
        let frames = config.average_frames;
        registry.register(FilterId::Average, move || {
            Box::new(FrameAverage::new(frames)) as Box<dyn Filter>
        });
        let frames = config.best_shot_frames;
        registry.register(FilterId::BestShot, move || {
            Box::new(BestShot::new(frames)) as Box<dyn Filter>
        });
        registry
    }

    /// Register (or replace) the factory for `id`. Registering `None` is
    /// ignored: no filter is always the passthrough path.
    pub fn register<F>(&mut self, id: FilterId, factory: F)
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync + 'static,
    {
        if id == FilterId::None {
            return;
        }
        self.factories.insert(id, Arc::new(factory));
    }

    pub fn contains(&self, id: FilterId) -> bool {
        self.factories.contains_key(&id)
    }

    pub fn create(&self, id: FilterId) -> Option<Box<dyn Filter>> {
        self.factories.get(&id).map(|factory| factory())
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().map(|id| id.as_str()).collect();
        ids.sort_unstable();
        f.debug_struct("FilterRegistry").field("filters", &ids).finish()
    }
}

/// Strided luma/chroma planes of one ingested frame, copied tight
pub(crate) fn packed_planes(luma: &[u8], chroma: &[u8], geometry: &FrameGeometry) -> (Vec<u8>, Vec<u8>) {
    let mut y = Vec::with_capacity((geometry.width * geometry.height) as usize);
    crate::utils::pack_plane(luma, geometry.luma_stride, geometry.width, geometry.height, &mut y);
    let mut c = Vec::with_capacity((geometry.chroma_row_bytes() * geometry.chroma_rows()) as usize);
    crate::utils::pack_plane(
        chroma,
        geometry.chroma_stride,
        geometry.chroma_row_bytes(),
        geometry.chroma_rows(),
        &mut c,
    );
    (y, c)
}

/// Whether the planes are long enough for the geometry
pub(crate) fn planes_fit(luma: &[u8], chroma: &[u8], geometry: &FrameGeometry) -> bool {
    luma.len() >= plane_min_len(geometry.luma_stride, geometry.width, geometry.height)
        && chroma.len()
            >= plane_min_len(
                geometry.chroma_stride,
                geometry.chroma_row_bytes(),
                geometry.chroma_rows(),
            )
}
