pub mod capture;
pub mod diagnostics;
pub mod display;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use capture::driver::DeviceLimits;
use capture::frame::PixelFormat;
use capture::metadata::MetadataPolicy;
use capture::sim::SimulatorConfig;
use serde::{Deserialize, Serialize};

pub use capture::{CameraDriver, Frame, SimulatedCamera};
pub use error::{ConfigError, SessionError};
pub use export::{ExportFormat, Exporter};
pub use pipeline::{FrameBuffer, Session, SessionEvent, SessionState};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub acquisition: AcquisitionConfig,
    pub session: SessionConfig,
    pub export: ExportConfig,
    pub simulator: SimulatorConfig,
}

impl Config {
    /// Layer defaults, an optional TOML file and `STROBE__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("STROBE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

/// Sensor region read out, in unbinned sensor pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(offset_x: u32, offset_y: u32, width: u32, height: u32) -> Self {
        Self {
            offset_x,
            offset_y,
            width,
            height,
        }
    }
}

/// Acquisition settings, immutable once a session is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub roi: Roi,
    pub binning: u32,
    pub exposure_us: f64,
    pub gain_db: f64,
    pub pixel_format: PixelFormat,
    pub target_frames: usize,
    /// Requested acquisition rate, frames per second
    pub frame_rate: f64,
    /// Container rate of the exported video, unrelated to the acquisition rate
    pub playback_fps: u32,
}

impl AcquisitionConfig {
    /// Image dimensions delivered after binning
    pub fn output_dimensions(&self) -> (u32, u32) {
        let binning = self.binning.max(1);
        (self.roi.width / binning, self.roi.height / binning)
    }

    /// Check the configuration against itself and the device-reported limits
    pub fn validate(&self, limits: &DeviceLimits) -> Result<(), ConfigError> {
        if (self.sensor_width, self.sensor_height) != (limits.sensor_width, limits.sensor_height) {
            return Err(ConfigError::SensorMismatch {
                width: self.sensor_width,
                height: self.sensor_height,
                device_width: limits.sensor_width,
                device_height: limits.sensor_height,
            });
        }

        check_axis("x", self.roi.offset_x, self.roi.width, self.sensor_width)?;
        check_axis("y", self.roi.offset_y, self.roi.height, self.sensor_height)?;

        if self.binning == 0 || self.binning > limits.max_binning {
            return Err(ConfigError::InvalidBinning {
                value: self.binning,
                max: limits.max_binning,
            });
        }
        let (width, height) = self.output_dimensions();
        if width == 0 || height == 0 {
            return Err(ConfigError::EmptyRoi);
        }

        let (min, max) = limits.exposure_us;
        if !(min..=max).contains(&self.exposure_us) {
            return Err(ConfigError::ExposureOutOfRange {
                value: self.exposure_us,
                min,
                max,
            });
        }
        let (min, max) = limits.gain_db;
        if !(min..=max).contains(&self.gain_db) {
            return Err(ConfigError::GainOutOfRange {
                value: self.gain_db,
                min,
                max,
            });
        }

        if !limits.pixel_formats.contains(&self.pixel_format) {
            return Err(ConfigError::UnsupportedPixelFormat(self.pixel_format));
        }
        if self.target_frames == 0 {
            return Err(ConfigError::ZeroFrameCount);
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(ConfigError::InvalidRate {
                name: "frame_rate",
                value: self.frame_rate,
            });
        }
        if self.playback_fps == 0 {
            return Err(ConfigError::InvalidRate {
                name: "playback_fps",
                value: 0.0,
            });
        }
        Ok(())
    }
}

fn check_axis(axis: &'static str, offset: u32, size: u32, sensor: u32) -> Result<(), ConfigError> {
    if size == 0 {
        return Err(ConfigError::EmptyRoi);
    }
    match offset.checked_add(size) {
        Some(end) if end <= sensor => Ok(()),
        _ => Err(ConfigError::RoiOutOfBounds {
            axis,
            offset,
            size,
            sensor,
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Interval between frame-count polls while acquiring
    pub poll_interval_ms: u64,
    /// Give up waiting for frames after this long; unset waits forever
    pub acquisition_timeout_ms: Option<u64>,
    pub metadata_policy: MetadataPolicy,
    pub output_dir: PathBuf,
    /// Depth of the observer event channel; events are dropped when full
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub video_backend: export::VideoBackend,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sensor_width: 1440,
            sensor_height: 1080,
            roi: Roi::new(560, 420, 320, 240),
            binning: 1,
            exposure_us: 1000.0,
            gain_db: 0.0,
            pixel_format: PixelFormat::Rgb8,
            target_frames: 1000,
            frame_rate: 200.0,
            playback_fps: 20,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            acquisition_timeout_ms: None,
            metadata_policy: MetadataPolicy::Lenient,
            output_dir: PathBuf::from("."),
            event_capacity: 64,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::Video,
            video_backend: export::VideoBackend::H264,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            sensor_width: 1440,
            sensor_height: 1080,
            exposure_us: (20.0, 1_000_000.0),
            gain_db: (0.0, 24.0),
            max_binning: 4,
            pixel_formats: PixelFormat::ALL.to_vec(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        AcquisitionConfig::default()
            .validate(&limits())
            .expect("defaults fit the default sensor");
    }

    #[test]
    fn test_roi_touching_sensor_edge_is_valid() {
        let mut config = AcquisitionConfig::default();
        config.roi = Roi::new(1120, 840, 320, 240);
        config.validate(&limits()).expect("offset + size == sensor is allowed");

        config.roi = Roi::new(0, 0, 1440, 1080);
        config.validate(&limits()).expect("full sensor is allowed");
    }

    #[test]
    fn test_roi_past_sensor_edge_is_rejected() {
        let mut config = AcquisitionConfig::default();
        config.roi = Roi::new(1121, 0, 320, 240);
        assert!(matches!(
            config.validate(&limits()),
            Err(ConfigError::RoiOutOfBounds { axis: "x", .. })
        ));

        config.roi = Roi::new(0, 841, 320, 240);
        assert!(matches!(
            config.validate(&limits()),
            Err(ConfigError::RoiOutOfBounds { axis: "y", .. })
        ));

        config.roi = Roi::new(u32::MAX, 0, 320, 240);
        assert!(matches!(
            config.validate(&limits()),
            Err(ConfigError::RoiOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_bounds_on_exposure_gain_and_binning() {
        let mut config = AcquisitionConfig::default();
        config.exposure_us = 5.0;
        assert!(matches!(
            config.validate(&limits()),
            Err(ConfigError::ExposureOutOfRange { .. })
        ));

        let mut config = AcquisitionConfig::default();
        config.gain_db = 30.0;
        assert!(matches!(
            config.validate(&limits()),
            Err(ConfigError::GainOutOfRange { .. })
        ));

        let mut config = AcquisitionConfig::default();
        config.binning = 0;
        assert!(matches!(
            config.validate(&limits()),
            Err(ConfigError::InvalidBinning { .. })
        ));
        config.binning = 8;
        assert!(matches!(
            config.validate(&limits()),
            Err(ConfigError::InvalidBinning { .. })
        ));
    }

    #[test]
    fn test_binning_shrinks_output() {
        let mut config = AcquisitionConfig::default();
        config.binning = 2;
        assert_eq!(config.output_dimensions(), (160, 120));
        config.validate(&limits()).expect("binned roi is valid");

        config.roi = Roi::new(0, 0, 3, 1);
        config.binning = 4;
        assert!(matches!(config.validate(&limits()), Err(ConfigError::EmptyRoi)));
    }

    #[test]
    fn test_counts_rates_and_formats() {
        let mut config = AcquisitionConfig::default();
        config.target_frames = 0;
        assert!(matches!(config.validate(&limits()), Err(ConfigError::ZeroFrameCount)));

        let mut config = AcquisitionConfig::default();
        config.playback_fps = 0;
        assert!(matches!(config.validate(&limits()), Err(ConfigError::InvalidRate { .. })));

        let mut config = AcquisitionConfig::default();
        config.frame_rate = f64::NAN;
        assert!(matches!(config.validate(&limits()), Err(ConfigError::InvalidRate { .. })));

        let mut narrow = limits();
        narrow.pixel_formats = vec![PixelFormat::Mono8];
        assert!(matches!(
            AcquisitionConfig::default().validate(&narrow),
            Err(ConfigError::UnsupportedPixelFormat(PixelFormat::Rgb8))
        ));
    }

    #[test]
    fn test_sensor_mismatch_is_rejected() {
        let mut config = AcquisitionConfig::default();
        config.sensor_width = 1920;
        assert!(matches!(config.validate(&limits()), Err(ConfigError::SensorMismatch { .. })));
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("strobe.toml");
        std::fs::write(
            &path,
            concat!(
                "[acquisition]\ntarget_frames = 250\npixel_format = \"RGB16\"\n\n",
                "[export]\nformat = \"imagestack\"\n",
            ),
        )
        .expect("write config");

        let config = Config::load(Some(&path)).expect("config loads");
        assert_eq!(config.acquisition.target_frames, 250);
        assert_eq!(config.acquisition.pixel_format, PixelFormat::Rgb16);
        assert_eq!(config.acquisition.playback_fps, 20);
        assert_eq!(config.export.format, ExportFormat::ImageStack);
        assert_eq!(config.session.poll_interval_ms, 50);
    }
}
