pub mod frame;
pub mod slot;
pub mod synthetic;

pub use frame::{AeState, CaptureMetadata, FrameGeometry, PixelFormat, Plane, RawFrame};
pub use slot::FrameSlot;
pub use synthetic::SyntheticSource;
