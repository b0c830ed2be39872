pub mod driver;
pub mod frame;
pub mod metadata;
pub mod sim;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use driver::{AcquisitionReport, CameraDriver, DeviceLimits, DrainedFrames, FrameStream};
pub use frame::{Frame, Image, PixelFormat, PreviewFrame};
pub use metadata::{MetadataChunk, MetadataPolicy, RawChunk};
pub use sim::{SimulatedCamera, SimulatorConfig};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;
