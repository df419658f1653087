//! Result encoders.
//!
//! The accumulator hands each finalized [`ResultImage`] to an
//! [`ImageEncoder`]; the encoded bytes go to the capture listener.

use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::{imageops, ExtendedColorType, RgbImage};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::filter::{ResultImage, Roi};
use crate::utils;
use crate::EncoderConfig;

pub trait ImageEncoder: Send + Sync {
    /// Short format name carried with the encoded result
    fn format(&self) -> &'static str;

    /// Encode the region of interest of `image`. Returns the bytes and the
    /// region actually encoded.
    fn encode(&self, image: &ResultImage, orientation: u32) -> Result<(Vec<u8>, Roi)>;
}

/// Baseline JPEG via the `image` crate
#[derive(Debug, Clone)]
pub struct JpegEncoder {
    quality: u8,
    mirror: bool,
}

impl JpegEncoder {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            quality: config.jpeg_quality.clamp(1, 100),
            mirror: config.mirror,
        }
    }
}

impl ImageEncoder for JpegEncoder {
    fn format(&self) -> &'static str {
        "jpeg"
    }

    #[instrument(skip(self, image), fields(width = image.width, height = image.height))]
    fn encode(&self, image: &ResultImage, orientation: u32) -> Result<(Vec<u8>, Roi)> {
        let roi = image.roi;
        let rgb = utils::roi_to_rgb(image, roi).ok_or_else(|| {
            Error::InvalidFrame(format!(
                "roi {roi:?} outside {}x{} result",
                image.width, image.height
            ))
        })?;
        let mut rgb = RgbImage::from_raw(roi.width, roi.height, rgb)
            .ok_or_else(|| Error::InvalidFrame("rgb buffer size mismatch".to_string()))?;
        if self.mirror {
            imageops::flip_horizontal_in_place(&mut rgb);
        }

        let mut out = Vec::with_capacity((roi.width * roi.height / 4) as usize);
        let mut encoder = ImageJpegEncoder::new_with_quality(&mut out, self.quality);
        encoder.encode(rgb.as_raw(), roi.width, roi.height, ExtendedColorType::Rgb8)?;

        debug!(bytes = out.len(), orientation, "Encoded JPEG");
        Ok((out, roi))
    }
}

/// Emits the semi-planar result unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

impl ImageEncoder for RawEncoder {
    fn format(&self) -> &'static str {
        "yuv420sp"
    }

    fn encode(&self, image: &ResultImage, _orientation: u32) -> Result<(Vec<u8>, Roi)> {
        Ok((image.data.clone(), image.roi))
    }
}
