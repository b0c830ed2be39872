//! Error taxonomy for capture, buffering, export and diagnostics

use std::path::PathBuf;

use thiserror::Error;

use crate::capture::frame::PixelFormat;
use crate::pipeline::session::SessionState;

/// Invalid acquisition settings, rejected before any device command is issued
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ROI {axis} offset {offset} + size {size} exceeds sensor {axis} extent {sensor}")]
    RoiOutOfBounds {
        axis: &'static str,
        offset: u32,
        size: u32,
        sensor: u32,
    },

    #[error("ROI must be at least one pixel wide and tall after binning")]
    EmptyRoi,

    #[error("binning factor {value} outside supported range 1..={max}")]
    InvalidBinning { value: u32, max: u32 },

    #[error("exposure {value} us outside device range [{min}, {max}]")]
    ExposureOutOfRange { value: f64, min: f64, max: f64 },

    #[error("gain {value} dB outside device range [{min}, {max}]")]
    GainOutOfRange { value: f64, min: f64, max: f64 },

    #[error("pixel format {0} is not supported by the device")]
    UnsupportedPixelFormat(PixelFormat),

    #[error("sensor is {device_width}x{device_height} but configuration says {width}x{height}")]
    SensorMismatch {
        width: u32,
        height: u32,
        device_width: u32,
        device_height: u32,
    },

    #[error("target frame count must be positive")]
    ZeroFrameCount,

    #[error("{name} must be a positive rate, got {value}")]
    InvalidRate { name: &'static str, value: f64 },

    #[error("device rejected configuration: {0}")]
    Rejected(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Failures reported by a camera driver
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device disconnected")]
    Disconnected,

    #[error("transport fault: {0}")]
    Transport(String),

    #[error("device rejected request: {0}")]
    Rejected(String),

    #[error("device not ready: {0}")]
    NotReady(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A metadata record that lacks a required field or carries the wrong kind of value
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("malformed metadata for frame {index}: field {field} {reason}")]
pub struct MalformedMetadata {
    pub index: usize,
    pub field: String,
    pub reason: String,
}

/// Contract violations on the frame buffer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("frame buffer already holds its {capacity} frames")]
    CapacityExceeded { capacity: usize },

    #[error("frame buffer was already consumed")]
    AlreadyConsumed,

    #[error("frame {index} is {found:?}, buffer holds {expected:?}")]
    MixedFormat {
        index: usize,
        expected: (u32, u32, PixelFormat),
        found: (u32, u32, PixelFormat),
    },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{exporter} exporter cannot encode {bits}-bit frames")]
    UnsupportedBitDepth { exporter: &'static str, bits: u8 },

    #[error("{exporter} exporter cannot encode {channels}-channel frames")]
    UnsupportedChannels {
        exporter: &'static str,
        channels: u8,
    },

    #[error("{exporter} exporter cannot encode {width}x{height} frames")]
    UnsupportedDimensions {
        exporter: &'static str,
        width: u32,
        height: u32,
    },

    #[error("burst holds {found} frames, expected {expected}")]
    IncompleteBurst { found: usize, expected: usize },

    #[error("frame {index} payload is {found} bytes, expected {expected}")]
    PayloadSize {
        index: usize,
        found: usize,
        expected: usize,
    },

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("TIFF encoding failed: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("video pipeline error: {0}")]
    Pipeline(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the acquisition session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("acquisition aborted after {available} of {target} frames: {source}")]
    AcquisitionAborted {
        available: usize,
        target: usize,
        #[source]
        source: DriverError,
    },

    #[error("acquisition timed out after {elapsed:?} with {available} of {target} frames")]
    AcquisitionTimeout {
        elapsed: std::time::Duration,
        available: usize,
        target: usize,
    },

    #[error("metadata decoding failed: {0}")]
    Metadata(#[from] MalformedMetadata),

    #[error("frame buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("failed to write sidecar {path}: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum DiagnosticsError {
    #[error("expected {expected} timestamps, got {found}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("need at least two frames to compute intervals, got {0}")]
    TooFewFrames(usize),

    #[error("frame rate must be positive, got {0}")]
    InvalidFrameRate(f64),
}
