//! Simulated camera for running without hardware.
//!
//! A producer thread renders a moving gradient for the configured pixel format and delivers
//! frames on its own schedule, exactly like a real device filling its on-board buffer. Timestamps
//! follow the requested frame rate with seeded jitter, so timing diagnostics behave like on a
//! real sensor. Faults (transport error, stall, malformed chunk) can be injected for testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::driver::{
    AcquisitionReport, CameraDriver, CaptureCollector, Captured, DeviceLimits, DrainedFrames,
    FrameStream,
};
use crate::capture::frame::{Image, PixelFormat, PreviewFrame};
use crate::capture::metadata::{self, ChunkValue, RawChunk};
use crate::error::DriverError;
use crate::{AcquisitionConfig, Roi};

const PREVIEW_DEPTH: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub exposure_min_us: f64,
    pub exposure_max_us: f64,
    pub gain_min_db: f64,
    pub gain_max_db: f64,
    pub max_binning: u32,
    pub black_level: f64,
    /// Peak arrival jitter, clamped to a quarter of the frame period
    pub jitter_us: f64,
    /// Pace frames in wall-clock time instead of producing them as fast as possible
    pub realtime: bool,
    pub isp_enabled: bool,
    pub seed: u64,
    /// Report a transport fault after this many frames
    pub fail_after: Option<usize>,
    /// Stop delivering frames after this many, keeping the link up
    pub stall_after: Option<usize>,
    /// Drop the gain field from the chunk of this frame index
    pub corrupt_chunk: Option<usize>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            sensor_width: 1440,
            sensor_height: 1080,
            exposure_min_us: 20.0,
            exposure_max_us: 1_000_000.0,
            gain_min_db: 0.0,
            gain_max_db: 24.0,
            max_binning: 4,
            black_level: 64.0,
            jitter_us: 50.0,
            realtime: true,
            isp_enabled: true,
            seed: 0x5eed,
            fail_after: None,
            stall_after: None,
            corrupt_chunk: None,
        }
    }
}

/// Simulated machine-vision camera
pub struct SimulatedCamera {
    config: SimulatorConfig,
    acquisition: Option<AcquisitionConfig>,
    epoch: Instant,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    capture: Option<CaptureCollector>,
    report: Option<AcquisitionReport>,
    closed: bool,
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimulatedCamera {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            acquisition: None,
            epoch: Instant::now(),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            capture: None,
            report: None,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed {
            Err(DriverError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn configured(&self) -> Result<AcquisitionConfig, DriverError> {
        self.acquisition
            .clone()
            .ok_or_else(|| DriverError::NotReady("device not configured".into()))
    }

    fn halt_worker(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("simulated camera worker panicked");
            }
        }
        self.stop = Arc::new(AtomicBool::new(false));
    }

    fn effective_roi(config: &AcquisitionConfig) -> Roi {
        let binning = config.binning.max(1);
        let (width, height) = config.output_dimensions();
        Roi::new(config.roi.offset_x / binning, config.roi.offset_y / binning, width, height)
    }
}

impl CameraDriver for SimulatedCamera {
    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            sensor_width: self.config.sensor_width,
            sensor_height: self.config.sensor_height,
            exposure_us: (self.config.exposure_min_us, self.config.exposure_max_us),
            gain_db: (self.config.gain_min_db, self.config.gain_max_db),
            max_binning: self.config.max_binning,
            pixel_formats: PixelFormat::ALL.to_vec(),
        }
    }

    fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), DriverError> {
        self.ensure_open()?;
        if self.worker.is_some() {
            return Err(DriverError::Rejected("cannot reconfigure while streaming".into()));
        }
        debug!(?config.roi, binning = config.binning, "simulated camera configured");
        self.acquisition = Some(config.clone());
        Ok(())
    }

    fn start_preview(&mut self) -> Result<FrameStream, DriverError> {
        self.ensure_open()?;
        let config = self.configured()?;
        self.halt_worker();

        let (tx, rx) = flume::bounded(PREVIEW_DEPTH);
        let stop = Arc::clone(&self.stop);
        let epoch = self.epoch;
        let realtime = self.config.realtime;
        let period = Duration::from_secs_f64(1.0 / config.frame_rate);

        self.worker = Some(thread::spawn(move || {
            let (width, height) = config.output_dimensions();
            let mut index = 0usize;
            while !stop.load(Ordering::Acquire) {
                let frame = PreviewFrame {
                    image: render(width, height, config.pixel_format, index),
                    timestamp: epoch.elapsed().as_secs_f64(),
                };
                match tx.try_send(frame) {
                    Ok(()) | Err(flume::TrySendError::Full(_)) => {}
                    Err(flume::TrySendError::Disconnected(_)) => break,
                }
                index += 1;
                thread::sleep(if realtime { period } else { Duration::from_millis(5) });
            }
        }));
        info!("simulated preview started");
        Ok(rx)
    }

    fn start_capture(&mut self, count: usize) -> Result<(), DriverError> {
        self.ensure_open()?;
        let config = self.configured()?;
        self.halt_worker();

        let (tx, rx) = flume::unbounded();
        let stop = Arc::clone(&self.stop);
        let sim = self.config.clone();
        let start = self.epoch.elapsed().as_secs_f64();
        let epoch = self.epoch;

        self.worker = Some(thread::spawn(move || {
            let (width, height) = config.output_dimensions();
            let period = 1.0 / config.frame_rate;
            let jitter = (sim.jitter_us * 1e-6).min(period / 4.0);
            let mut rng = StdRng::seed_from_u64(sim.seed);

            for index in 0..count {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                if sim.fail_after == Some(index) {
                    let _ = tx.send(Err(DriverError::Transport(format!(
                        "simulated link loss after {index} frames"
                    ))));
                    return;
                }
                if sim.stall_after == Some(index) {
                    // Keep the channel open so the host sees a silent device
                    while !stop.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    return;
                }

                let offset = if jitter > 0.0 { rng.gen_range(-jitter..=jitter) } else { 0.0 };
                let timestamp = start + period * (index + 1) as f64 + offset;
                if sim.realtime {
                    let due = Duration::from_secs_f64(timestamp.max(0.0));
                    if let Some(wait) = due.checked_sub(epoch.elapsed()) {
                        thread::sleep(wait);
                    }
                }

                let mut chunk = chunk_for(index, &config, sim.black_level);
                if sim.corrupt_chunk == Some(index) {
                    chunk.remove(metadata::GAIN);
                }
                let captured = Captured {
                    image: render(width, height, config.pixel_format, index),
                    timestamp,
                    chunk,
                };
                if tx.send(Ok(captured)).is_err() {
                    return;
                }
            }
        }));

        self.capture = Some(CaptureCollector::new(count, rx));
        info!(count, "simulated capture armed");
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
        let config = self.configured()?;
        let Some(capture) = self.capture.take() else {
            return Err(DriverError::NotReady("no capture armed".into()));
        };
        if available < capture.target() {
            self.capture = Some(capture);
            return Err(DriverError::NotReady(format!("{available} frames captured")));
        }
        self.halt_worker();

        let drained = capture.into_drained();
        let measured_frame_rate = drained.measured_frame_rate().unwrap_or(config.frame_rate);
        let color_space = if self.config.isp_enabled && config.pixel_format.channels() == 3 {
            "sRGB"
        } else {
            "Raw"
        };
        self.report = Some(AcquisitionReport {
            color_space: color_space.into(),
            measured_frame_rate,
            isp_enabled: self.config.isp_enabled,
            effective_roi: Self::effective_roi(&config),
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
        info!("simulated camera released");
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.halt_worker();
    }
}

fn chunk_for(index: usize, config: &AcquisitionConfig, black_level: f64) -> RawChunk {
    RawChunk::new()
        .with(metadata::FRAME_ID, ChunkValue::Integer(index as i64))
        .with(metadata::EXPOSURE_TIME, ChunkValue::Float(config.exposure_us))
        .with(metadata::GAIN, ChunkValue::Float(config.gain_db))
        .with(metadata::BLACK_LEVEL, ChunkValue::Float(black_level))
        .with(
            metadata::PIXEL_FORMAT,
            ChunkValue::Text(config.pixel_format.name().to_owned()),
        )
}

/// Render a smooth gradient that drifts with the frame index.
///
/// 16-bit formats carry a varying low byte so lossy paths are detectable.
pub fn render(width: u32, height: u32, format: PixelFormat, index: usize) -> Image {
    let channels = usize::from(format.channels());
    let (w, h) = (width as usize, height as usize);
    let drift = index % 32;
    let mut samples = Vec::with_capacity(w * h * channels);

    for y in 0..h {
        let row = y * 60 / h.max(1);
        for x in 0..w {
            let base = x * 150 / w.max(1) + row + drift;
            for c in 0..channels {
                samples.push(((base + c * 8) as u16) << 8 | ((x + y + index) & 0xff) as u16);
            }
        }
    }

    let data = if format.bit_depth() == 8 {
        samples.iter().map(|sample| (sample >> 8) as u8).collect::<Vec<u8>>()
    } else {
        let mut bytes = vec![0u8; samples.len() * 2];
        LittleEndian::write_u16_into(&samples, &mut bytes);
        bytes
    };
    Image::new(width, height, format, data)
}
