//! Post-capture multi-frame image pipeline.
//!
//! Frames and capture metadata arrive on camera callback threads, are
//! optionally matched in a zero-shutter-lag ring buffer, accumulated for a
//! multi-frame [`filter::Filter`] on a dedicated worker, and handed to an
//! encoder once the filter's frame count is met. A watchdog resets stalled
//! accumulations.

pub mod capture;
pub mod context;
pub mod encode;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod processor;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{AeState, CaptureMetadata, FrameGeometry, FrameSlot, PixelFormat, Plane, RawFrame};
pub use context::{PipelineContext, PipelineMetrics};
pub use error::{Error, Result};
pub use filter::{Filter, FilterId, FilterRegistry, ResultImage, Roi};
pub use encode::{ImageEncoder, JpegEncoder, RawEncoder};
pub use pipeline::{
    AccumulatorState, AccumulatorStatus, CaptureEvent, CaptureListener, EncodedResult,
    FailureReason, FrameAccumulator, Notice, RingEntry, ZslListener, ZslRingBuffer,
};
pub use processor::{PostProcessor, ProcessorStatus};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "POSTCAPTURE";

/// Pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub zsl: ZslConfig,
    pub accumulator: AccumulatorConfig,
    pub watchdog: WatchdogConfig,
    pub filters: FilterConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZslConfig {
    pub enabled: bool,
    /// Maximum number of buffered entries before complete ones are evicted
    pub capacity: usize,
    /// Hard cap on entries still waiting for their image or metadata
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Frames allowed between producer callback and worker completion
    pub max_in_flight: usize,
    pub pin_worker_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub tick_ms: u64,
    /// Ticks without a finalize before the watchdog resets the filter
    pub threshold_ticks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub average_frames: usize,
    pub best_shot_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub jpeg_quality: u8,
    /// Flip results horizontally (front camera)
    pub mirror: bool,
}

impl Default for ZslConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 5,
            max_pending: 16,
        }
    }
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 2,
            pin_worker_core: None,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            threshold_ticks: 20, // ~4s at the default tick
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            average_frames: 4,
            best_shot_frames: 3,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            mirror: false,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered with
    /// `POSTCAPTURE__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));

        if self.zsl.capacity == 0 {
            return invalid("zsl.capacity must be at least 1");
        }
        if self.zsl.max_pending == 0 {
            return invalid("zsl.max_pending must be at least 1");
        }
        if self.accumulator.max_in_flight == 0 {
            return invalid("accumulator.max_in_flight must be at least 1");
        }
        if self.watchdog.tick_ms == 0 || self.watchdog.threshold_ticks == 0 {
            return invalid("watchdog tick and threshold must be non-zero");
        }
        if self.filters.average_frames == 0 || self.filters.best_shot_frames == 0 {
            return invalid("filter frame counts must be at least 1");
        }
        if !(1..=100).contains(&self.encoder.jpeg_quality) {
            return invalid("encoder.jpeg_quality must be within 1..=100");
        }
        Ok(())
    }
}
