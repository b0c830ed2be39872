//! V4L2 camera driver
//!
//! Streams raw frames from a V4L2 node with memory-mapped buffers on a worker thread. The
//! node runs at full sensor size and the ROI is cut out in software, since V4L2 has no
//! portable ROI offset. There is no chunk data on V4L2, so each frame's chunk is synthesized
//! from the buffer sequence number and the control values read back after configuration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::driver::{
    AcquisitionReport, CameraDriver, CaptureCollector, Captured, DeviceLimits, DrainedFrames,
    FrameStream,
};
use crate::capture::frame::{Image, PixelFormat, PreviewFrame};
use crate::capture::metadata::{self, ChunkValue, RawChunk};
use crate::error::DriverError;
use crate::AcquisitionConfig;

const BUFFER_COUNT: u32 = 4;
const PREVIEW_DEPTH: usize = 4;

// V4L2 control ids (linux/v4l2-controls.h)
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_GAIN: u32 = 0x0098_0913;
const CID_BLACK_LEVEL: u32 = 0x0098_090b;

/// Map a V4L2 fourcc to the raw formats we can buffer
pub fn fourcc_to_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"GREY" => Some(PixelFormat::Mono8),
        b"Y16 " => Some(PixelFormat::Mono16),
        b"RGGB" => Some(PixelFormat::BayerRg8),
        b"RG16" => Some(PixelFormat::BayerRg16),
        b"RGB3" => Some(PixelFormat::Rgb8),
        _ => None,
    }
}

fn format_to_fourcc(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Mono8 => Some(FourCC::new(b"GREY")),
        PixelFormat::Mono16 => Some(FourCC::new(b"Y16 ")),
        PixelFormat::BayerRg8 => Some(FourCC::new(b"RGGB")),
        PixelFormat::BayerRg16 => Some(FourCC::new(b"RG16")),
        PixelFormat::Rgb8 => Some(FourCC::new(b"RGB3")),
        PixelFormat::Rgb16 => None,
    }
}

/// Settings as the device reports them after `configure`
#[derive(Debug, Clone, Copy)]
struct Applied {
    exposure_us: f64,
    gain_db: f64,
    black_level: f64,
}

/// Camera behind a V4L2 capture node
pub struct V4l2Camera {
    path: PathBuf,
    device: Device,
    limits: DeviceLimits,
    acquisition: Option<AcquisitionConfig>,
    applied: Option<Applied>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    capture: Option<CaptureCollector>,
    report: Option<AcquisitionReport>,
    closed: bool,
}

impl V4l2Camera {
    /// Open a capture node and query its limits
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DriverError> {
        let path = path.into();
        info!("Initializing V4L2 camera: {}", path.display());

        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DriverError::Rejected("device doesn't support video capture".into()));
        }

        let limits = query_limits(&device)?;
        info!(
            "Sensor {}x{}, formats {:?}",
            limits.sensor_width, limits.sensor_height, limits.pixel_formats
        );

        Ok(Self {
            path,
            device,
            limits,
            acquisition: None,
            applied: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            capture: None,
            report: None,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed {
            Err(DriverError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn configured(&self) -> Result<(AcquisitionConfig, Applied), DriverError> {
        match (&self.acquisition, self.applied) {
            (Some(config), Some(applied)) => Ok((config.clone(), applied)),
            _ => Err(DriverError::NotReady("device not configured".into())),
        }
    }

    fn halt_worker(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("V4L2 worker panicked");
            }
        }
        self.stop = Arc::new(AtomicBool::new(false));
    }

    /// Best effort: not every node exposes every control
    fn set_control(&self, id: u32, value: i64, name: &str) {
        if let Err(e) = self.device.set_control(Control {
            id,
            value: Value::Integer(value),
        }) {
            warn!("{} control not applied: {}", name, e);
        }
    }

    fn read_control(&self, id: u32) -> Option<i64> {
        match self.device.control(id) {
            Ok(Control {
                value: Value::Integer(value),
                ..
            }) => Some(value),
            _ => None,
        }
    }
}

impl CameraDriver for V4l2Camera {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), DriverError> {
        self.ensure_open()?;
        if self.worker.is_some() {
            return Err(DriverError::Rejected("cannot reconfigure while streaming".into()));
        }
        let fourcc = format_to_fourcc(config.pixel_format).ok_or_else(|| {
            DriverError::Rejected(format!("{} has no V4L2 fourcc", config.pixel_format))
        })?;

        let mut fmt = self.device.format()?;
        fmt.width = self.limits.sensor_width;
        fmt.height = self.limits.sensor_height;
        fmt.fourcc = fourcc;
        let fmt = self.device.set_format(&fmt)?;
        let sensor = (self.limits.sensor_width, self.limits.sensor_height);
        if fmt.fourcc != fourcc || (fmt.width, fmt.height) != sensor {
            return Err(DriverError::Rejected(format!(
                "driver negotiated {} {}x{}",
                fmt.fourcc, fmt.width, fmt.height
            )));
        }

        let fps = config.frame_rate.round().max(1.0) as u32;
        let params = self.device.set_params(&Parameters::with_fps(fps))?;
        debug!("Frame interval {:?}", params.interval);

        // exposure_absolute counts 100 us units
        let exposure_units = (config.exposure_us / 100.0).round() as i64;
        self.set_control(CID_EXPOSURE_ABSOLUTE, exposure_units, "exposure");
        self.set_control(CID_GAIN, config.gain_db.round() as i64, "gain");

        let applied = Applied {
            exposure_us: self
                .read_control(CID_EXPOSURE_ABSOLUTE)
                .map_or(config.exposure_us, |units| units as f64 * 100.0),
            gain_db: self.read_control(CID_GAIN).map_or(config.gain_db, |gain| gain as f64),
            black_level: self.read_control(CID_BLACK_LEVEL).map_or(0.0, |level| level as f64),
        };
        info!(
            "Configured {} {}x{} @ {} fps, applied {:?}",
            config.pixel_format, config.roi.width, config.roi.height, fps, applied
        );
        self.acquisition = Some(config.clone());
        self.applied = Some(applied);
        Ok(())
    }

    fn start_preview(&mut self) -> Result<FrameStream, DriverError> {
        self.ensure_open()?;
        let (config, _) = self.configured()?;
        self.halt_worker();

        let (tx, rx) = flume::bounded(PREVIEW_DEPTH);
        let stop = Arc::clone(&self.stop);
        let path = self.path.clone();
        let sensor_width = self.limits.sensor_width;

        self.worker = Some(thread::spawn(move || {
            let result = stream_frames(&path, &stop, usize::MAX, |raw, (timestamp, _)| {
                let frame = PreviewFrame {
                    image: crop(raw, sensor_width, &config),
                    timestamp,
                };
                !matches!(tx.try_send(frame), Err(flume::TrySendError::Disconnected(_)))
            });
            if let Err(e) = result {
                warn!("Preview stream ended: {}", e);
            }
        }));
        info!("V4L2 preview started");
        Ok(rx)
    }

    fn start_capture(&mut self, count: usize) -> Result<(), DriverError> {
        self.ensure_open()?;
        let (config, applied) = self.configured()?;
        self.halt_worker();

        let (tx, rx) = flume::unbounded();
        let stop = Arc::clone(&self.stop);
        let path = self.path.clone();
        let sensor_width = self.limits.sensor_width;

        self.worker = Some(thread::spawn(move || {
            let mut delivered = 0usize;
            let result = stream_frames(&path, &stop, count, |raw, (timestamp, sequence)| {
                let captured = Captured {
                    image: crop(raw, sensor_width, &config),
                    timestamp,
                    chunk: chunk_for(sequence, &config, applied),
                };
                delivered += 1;
                tx.send(Ok(captured)).is_ok()
            });
            if let Err(e) = result {
                let reason = format!("after {delivered} frames: {e}");
                let _ = tx.send(Err(DriverError::Transport(reason)));
            }
        }));

        self.capture = Some(CaptureCollector::new(count, rx));
        info!(count, "V4L2 capture armed");
        Ok(())
    }

    fn frames_available(&mut self) -> Result<usize, DriverError> {
        self.ensure_open()?;
        self.capture
            .as_mut()
            .ok_or_else(|| DriverError::NotReady("no capture armed".into()))?
            .poll()
    }

    fn drain(&mut self) -> Result<DrainedFrames, DriverError> {
        let available = self.frames_available()?;
        let (config, _) = self.configured()?;
        let Some(capture) = self.capture.take() else {
            return Err(DriverError::NotReady("no capture armed".into()));
        };
        if available < capture.target() {
            self.capture = Some(capture);
            return Err(DriverError::NotReady(format!("{available} frames captured")));
        }
        self.halt_worker();

        let drained = capture.into_drained();
        let rgb = config.pixel_format.channels() == 3;
        self.report = Some(AcquisitionReport {
            color_space: if rgb { "sRGB" } else { "Raw" }.into(),
            measured_frame_rate: drained.measured_frame_rate().unwrap_or(config.frame_rate),
            // RGB3 only comes out of a driver-side ISP
            isp_enabled: rgb,
            effective_roi: config.roi,
        });
        Ok(drained)
    }

    fn report(&self) -> Result<AcquisitionReport, DriverError> {
        self.report
            .clone()
            .ok_or_else(|| DriverError::NotReady("no completed capture".into()))
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.halt_worker();
        self.capture = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.stop()?;
        self.closed = true;
        info!("V4L2 camera released: {}", self.path.display());
        Ok(())
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.halt_worker();
    }
}

/// Stream up to `count` buffers, handing each to `sink` with (seconds, sequence).
/// Stops early when `stop` is raised or `sink` returns false.
fn stream_frames<F>(
    path: &Path,
    stop: &AtomicBool,
    count: usize,
    mut sink: F,
) -> std::io::Result<()>
where
    F: FnMut(&[u8], (f64, u64)) -> bool,
{
    let device = Device::with_path(path)?;
    let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
    let mut seen = 0usize;
    while seen < count && !stop.load(Ordering::Acquire) {
        let (buf, meta) = stream.next()?;
        let timestamp = meta.timestamp.sec as f64 + meta.timestamp.usec as f64 * 1e-6;
        if !sink(buf, (timestamp, u64::from(meta.sequence))) {
            break;
        }
        seen += 1;
    }
    Ok(())
}

/// Cut the ROI out of a full-sensor buffer, then bin by decimation
fn crop(raw: &[u8], sensor_width: u32, config: &AcquisitionConfig) -> Image {
    let bpp = config.pixel_format.bytes_per_pixel();
    let binning = config.binning.max(1) as usize;
    let (width, height) = config.output_dimensions();
    let stride = sensor_width as usize * bpp;
    let roi = config.roi;

    let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
    for row in 0..height as usize {
        let y = roi.offset_y as usize + row * binning;
        for col in 0..width as usize {
            let x = roi.offset_x as usize + col * binning;
            let at = y * stride + x * bpp;
            match raw.get(at..at + bpp) {
                Some(pixel) => data.extend_from_slice(pixel),
                None => data.extend(std::iter::repeat(0).take(bpp)),
            }
        }
    }
    Image::new(width, height, config.pixel_format, data)
}

fn chunk_for(sequence: u64, config: &AcquisitionConfig, applied: Applied) -> RawChunk {
    RawChunk::new()
        .with(metadata::FRAME_ID, ChunkValue::Integer(sequence as i64))
        .with(metadata::EXPOSURE_TIME, ChunkValue::Float(applied.exposure_us))
        .with(metadata::GAIN, ChunkValue::Float(applied.gain_db))
        .with(metadata::BLACK_LEVEL, ChunkValue::Float(applied.black_level))
        .with(
            metadata::PIXEL_FORMAT,
            ChunkValue::Text(config.pixel_format.name().to_owned()),
        )
}

fn query_limits(device: &Device) -> Result<DeviceLimits, DriverError> {
    let mut pixel_formats = Vec::new();
    let mut sensor = (0u32, 0u32);
    for desc in device.enum_formats()? {
        let Some(format) = fourcc_to_format(desc.fourcc) else {
            continue;
        };
        pixel_formats.push(format);
        for size in device.enum_framesizes(desc.fourcc)? {
            let (width, height) = match size.size {
                FrameSizeEnum::Discrete(d) => (d.width, d.height),
                FrameSizeEnum::Stepwise(s) => (s.max_width, s.max_height),
            };
            if u64::from(width) * u64::from(height) > u64::from(sensor.0) * u64::from(sensor.1) {
                sensor = (width, height);
            }
        }
    }
    if pixel_formats.is_empty() {
        return Err(DriverError::Rejected("no raw pixel format offered".into()));
    }

    let mut exposure_us = (1.0, 1_000_000.0);
    let mut gain_db = (0.0, 0.0);
    if let Ok(controls) = device.query_controls() {
        for control in controls {
            match control.id {
                CID_EXPOSURE_ABSOLUTE => {
                    exposure_us = (control.minimum as f64 * 100.0, control.maximum as f64 * 100.0)
                }
                CID_GAIN => gain_db = (control.minimum as f64, control.maximum as f64),
                _ => {}
            }
        }
    }

    Ok(DeviceLimits {
        sensor_width: sensor.0,
        sensor_height: sensor.1,
        exposure_us,
        gain_db,
        max_binning: 4,
        pixel_formats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Roi;

    #[test]
    fn test_fourcc_mapping_round_trips() {
        for format in PixelFormat::ALL {
            if let Some(fourcc) = format_to_fourcc(format) {
                assert_eq!(fourcc_to_format(fourcc), Some(format));
            }
        }
        assert_eq!(fourcc_to_format(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_crop_takes_roi_rows() {
        // 4x3 mono sensor with pixel value = y * 4 + x
        let raw: Vec<u8> = (0..12).collect();
        let config = AcquisitionConfig {
            roi: Roi::new(1, 1, 2, 2),
            pixel_format: PixelFormat::Mono8,
            ..AcquisitionConfig::default()
        };
        let image = crop(&raw, 4, &config);
        assert_eq!(&image.data[..], &[5, 6, 9, 10]);

        let config = AcquisitionConfig {
            roi: Roi::new(0, 0, 4, 2),
            binning: 2,
            ..config
        };
        let image = crop(&raw, 4, &config);
        assert_eq!((image.width, image.height), (2, 1));
        assert_eq!(&image.data[..], &[0, 2]);
    }
}
