use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Callback run once when a frame's underlying buffer is given back
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Semi-planar YUV 4:2:0 layouts we accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Y plane followed by interleaved V/U
    Nv21,
    /// Y plane followed by interleaved U/V
    Nv12,
}

/// One image plane with its row stride in bytes
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub stride: u32,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, stride: u32) -> Self {
        Self {
            data: data.into(),
            stride,
        }
    }
}

/// Dimensions a filter is primed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub luma_stride: u32,
    pub chroma_stride: u32,
}

impl FrameGeometry {
    /// Rows in the interleaved chroma plane
    pub fn chroma_rows(&self) -> u32 {
        self.height.div_ceil(2)
    }

    /// Bytes per chroma row actually carrying samples
    pub fn chroma_row_bytes(&self) -> u32 {
        self.width.div_ceil(2) * 2
    }
}

/// Raw sensor frame handed over by the camera callback.
///
/// A frame has exactly one owner at a time. Its release hook runs exactly
/// once, either through [`RawFrame::release`] or when the frame is dropped,
/// so every exit path gives the buffer back.
pub struct RawFrame {
    luma: Plane,
    chroma: Plane,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Sensor timestamp in nanoseconds, the ZSL join key
    timestamp: i64,
    /// Clockwise rotation in degrees
    orientation: u32,
    release: Option<ReleaseHook>,
}

impl RawFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        luma: Plane,
        chroma: Plane,
        timestamp: i64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidFrame(format!("empty frame {width}x{height}")));
        }
        if luma.stride < width {
            return Err(Error::InvalidFrame(format!(
                "luma stride {} smaller than width {width}",
                luma.stride
            )));
        }

        let geometry = FrameGeometry {
            width,
            height,
            luma_stride: luma.stride,
            chroma_stride: chroma.stride,
        };
        if chroma.stride < geometry.chroma_row_bytes() {
            return Err(Error::InvalidFrame(format!(
                "chroma stride {} smaller than row width {}",
                chroma.stride,
                geometry.chroma_row_bytes()
            )));
        }

        let luma_min = plane_min_len(luma.stride, width, height);
        if luma.data.len() < luma_min {
            return Err(Error::InvalidFrame(format!(
                "luma plane has {} bytes, need {luma_min}",
                luma.data.len()
            )));
        }
        let chroma_min = plane_min_len(
            chroma.stride,
            geometry.chroma_row_bytes(),
            geometry.chroma_rows(),
        );
        if chroma.data.len() < chroma_min {
            return Err(Error::InvalidFrame(format!(
                "chroma plane has {} bytes, need {chroma_min}",
                chroma.data.len()
            )));
        }

        Ok(Self {
            luma,
            chroma,
            width,
            height,
            format,
            timestamp,
            orientation: 0,
            release: None,
        })
    }

    pub fn with_orientation(mut self, orientation: u32) -> Self {
        self.orientation = orientation % 360;
        self
    }

    /// Attach the callback that returns the buffer to its producer
    pub fn with_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    #[inline]
    pub fn luma(&self) -> &Plane {
        &self.luma
    }

    #[inline]
    pub fn chroma(&self) -> &Plane {
        &self.chroma
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn orientation(&self) -> u32 {
        self.orientation
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            width: self.width,
            height: self.height,
            luma_stride: self.luma.stride,
            chroma_stride: self.chroma.stride,
        }
    }

    /// Give the underlying buffer back now instead of at drop
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp", &self.timestamp)
            .field("orientation", &self.orientation)
            .field("luma_stride", &self.luma.stride)
            .field("chroma_stride", &self.chroma.stride)
            .finish()
    }
}

pub(crate) fn plane_min_len(stride: u32, row_bytes: u32, rows: u32) -> usize {
    if rows == 0 {
        return 0;
    }
    // The last row may be unpadded
    stride as usize * (rows as usize - 1) + row_bytes as usize
}

/// Auto-exposure state reported with each capture result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeState {
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

/// Per-frame capture result from the camera pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    /// Sensor timestamp in nanoseconds, matches [`RawFrame::timestamp`]
    pub timestamp: i64,
    pub frame_number: u64,
    pub ae_state: AeState,
    pub exposure_time_ns: Option<i64>,
    pub sensitivity: Option<i32>,
}

impl CaptureMetadata {
    pub fn new(timestamp: i64, ae_state: AeState) -> Self {
        Self {
            timestamp,
            frame_number: 0,
            ae_state,
            exposure_time_ns: None,
            sensitivity: None,
        }
    }

    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = frame_number;
        self
    }

    pub fn flash_required(&self) -> bool {
        self.ae_state == AeState::FlashRequired
    }
}
