use thiserror::Error;

/// Errors surfaced by configuration, frame construction and encoding.
///
/// Runtime pipeline faults (dropped frames, failed filters, stalls) are not
/// errors: they degrade to a skipped cycle and are reported through
/// [`crate::CaptureListener`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("failed to encode result: {0}")]
    Encode(#[from] image::ImageError),

    #[error("a picture request is already pending")]
    PictureRequestPending,

    #[error("post-processor is not open")]
    NotOpen,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
