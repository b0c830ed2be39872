//! Camera driver seam consumed by the acquisition session

use serde::{Deserialize, Serialize};

use crate::capture::frame::{Image, PixelFormat, PreviewFrame};
use crate::capture::metadata::RawChunk;
use crate::error::DriverError;
use crate::{AcquisitionConfig, Roi};

/// Live-view frames pushed by the driver; bounded, frames are dropped when nobody keeps up
pub type FrameStream = flume::Receiver<PreviewFrame>;

/// Device-reported bounds used to validate an [`AcquisitionConfig`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub exposure_us: (f64, f64),
    pub gain_db: (f64, f64),
    pub max_binning: u32,
    pub pixel_formats: Vec<PixelFormat>,
}

/// Result of one bulk drain; the three vectors are index-aligned
#[derive(Debug, Default)]
pub struct DrainedFrames {
    pub images: Vec<Image>,
    pub timestamps: Vec<f64>,
    pub chunks: Vec<RawChunk>,
}

impl DrainedFrames {
    /// Rate implied by the first and last arrival timestamp
    pub fn measured_frame_rate(&self) -> Option<f64> {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(first), Some(last)) if last > first => {
                Some((self.timestamps.len() - 1) as f64 / (last - first))
            }
            _ => None,
        }
    }
}

/// One frame handed over by a driver's worker thread
#[derive(Debug)]
pub(crate) struct Captured {
    pub image: Image,
    pub timestamp: f64,
    pub chunk: RawChunk,
}

/// Host side of an armed capture.
///
/// Counts what the worker delivered so far; the first fault is sticky.
pub(crate) struct CaptureCollector {
    target: usize,
    rx: flume::Receiver<Result<Captured, DriverError>>,
    pending: Vec<Captured>,
    fault: Option<String>,
}

impl CaptureCollector {
    pub fn new(target: usize, rx: flume::Receiver<Result<Captured, DriverError>>) -> Self {
        Self {
            target,
            rx,
            pending: Vec::with_capacity(target),
            fault: None,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Pull everything delivered since the last poll
    pub fn poll(&mut self) -> Result<usize, DriverError> {
        if let Some(fault) = &self.fault {
            return Err(DriverError::Transport(fault.clone()));
        }
        for delivered in self.rx.try_iter() {
            match delivered {
                Ok(frame) => self.pending.push(frame),
                Err(err) => {
                    self.fault = Some(err.to_string());
                    return Err(err);
                }
            }
        }
        Ok(self.pending.len())
    }

    pub fn into_drained(self) -> DrainedFrames {
        let mut drained = DrainedFrames::default();
        for frame in self.pending {
            drained.images.push(frame.image);
            drained.timestamps.push(frame.timestamp);
            drained.chunks.push(frame.chunk);
        }
        drained
    }
}

/// Session-level facts the device reports once a capture completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    pub color_space: String,
    pub measured_frame_rate: f64,
    pub isp_enabled: bool,
    /// ROI as read out after binning; may differ from the requested one
    pub effective_roi: Roi,
}

/// Abstraction over a machine-vision camera.
///
/// Calls are cheap and non-blocking; frames arrive on the device's own schedule and are
/// only counted until [`CameraDriver::drain`] hands them over in one shot.
pub trait CameraDriver {
    fn limits(&self) -> DeviceLimits;

    /// Apply sensor settings; called before any stream is started
    fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), DriverError>;

    fn start_preview(&mut self) -> Result<FrameStream, DriverError>;

    /// Arm the device to capture exactly `count` frames
    fn start_capture(&mut self, count: usize) -> Result<(), DriverError>;

    /// Frames captured so far by the armed acquisition
    fn frames_available(&mut self) -> Result<usize, DriverError>;

    fn drain(&mut self) -> Result<DrainedFrames, DriverError>;

    fn report(&self) -> Result<AcquisitionReport, DriverError>;

    /// Stop any running stream
    fn stop(&mut self) -> Result<(), DriverError>;

    /// Release the device
    fn close(&mut self) -> Result<(), DriverError>;
}

impl<D: CameraDriver + ?Sized> CameraDriver for Box<D> {
    fn limits(&self) -> DeviceLimits {
        (**self).limits()
    }

    fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), DriverError> {
        (**self).configure(config)
    }

    fn start_preview(&mut self) -> Result<FrameStream, DriverError> {
        (**self).start_preview()
    }

    fn start_capture(&mut self, count: usize) -> Result<(), DriverError> {
        (**self).start_capture(count)
    }

    fn frames_available(&mut self) -> Result<usize, DriverError> {
        (**self).frames_available()
    }

    fn drain(&mut self) -> Result<DrainedFrames, DriverError> {
        (**self).drain()
    }

    fn report(&self) -> Result<AcquisitionReport, DriverError> {
        (**self).report()
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        (**self).stop()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        (**self).close()
    }
}
