//! Acquisition session: owns the device and drives one burst from live view to export
//!
//! ```text
//!  Idle ──start_preview──► Previewing ──acquire──► Acquiring ──drain──► Drained ──export──► Closed
//!   ▲                          │                       │                                   ▲
//!   └───────stop_preview───────┘                       └──fault / timeout──────────────────┘
//! ```
//!
//! Every state can be closed explicitly; dropping a session that is not closed releases the
//! device as well.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::driver::{AcquisitionReport, CameraDriver, DrainedFrames, FrameStream};
use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::metadata::{self, MetadataPolicy};
use crate::error::{ConfigError, DriverError, MalformedMetadata, SessionError};
use crate::export::sidecar::Sidecar;
use crate::export::{Burst, ExportReport, Exporter};
use crate::pipeline::buffer::FrameBuffer;
use crate::utils::{self, FpsMeter};
use crate::{AcquisitionConfig, SessionConfig};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Previewing,
    Acquiring,
    Drained,
    Closed,
}

/// Live-view observation for a display
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewStatus {
    pub timestamp: f64,
    pub state: SessionState,
    pub width: u32,
    pub height: u32,
    pub measured_frame_rate: f64,
}

/// Observations published to progress displays; nothing flows back into the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Preview(PreviewStatus),
    Progress { available: usize, target: usize },
    Drained { frames: usize, sidecar: PathBuf },
    ExportFinished(ExportReport),
}

/// Facts captured when the burst was drained, shared by every exporter
#[derive(Debug, Clone)]
pub struct AcquisitionSnapshot {
    /// Timestamp-derived name shared by every artifact of this acquisition
    pub prefix: String,
    pub output_dir: PathBuf,
    pub sidecar_path: PathBuf,
    pub acquisition: AcquisitionConfig,
    pub report: AcquisitionReport,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub metadata_errors: usize,
}

/// Acquisition session over an exclusively owned camera driver
pub struct Session<D: CameraDriver> {
    driver: D,
    config: AcquisitionConfig,
    options: SessionConfig,
    state: SessionState,
    preview: Option<FrameStream>,
    preview_fps: FpsMeter,
    available: usize,
    buffer: Option<FrameBuffer>,
    snapshot: Option<AcquisitionSnapshot>,
    events: Option<flume::Sender<SessionEvent>>,
}

impl<D: CameraDriver> Session<D> {
    /// Validate `config` against the device and take ownership of it
    pub fn open(
        mut driver: D,
        config: AcquisitionConfig,
        options: SessionConfig,
    ) -> Result<Self, SessionError> {
        if let Err(err) = config.validate(&driver.limits()) {
            warn!("rejecting configuration: {err}");
            if let Err(close_err) = driver.close() {
                warn!("failed to release device: {close_err}");
            }
            return Err(err.into());
        }

        info!(
            roi = ?config.roi,
            binning = config.binning,
            format = %config.pixel_format,
            target = config.target_frames,
            "session opened"
        );
        Ok(Self {
            driver,
            config,
            options,
            state: SessionState::Idle,
            preview: None,
            preview_fps: FpsMeter::new(30),
            available: 0,
            buffer: None,
            snapshot: None,
            events: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Completed burst, present only while Drained
    pub fn buffer(&self) -> Option<&FrameBuffer> {
        self.buffer.as_ref()
    }

    pub fn snapshot(&self) -> Option<&AcquisitionSnapshot> {
        self.snapshot.as_ref()
    }

    /// Subscribe a display; events are dropped when the channel is full
    pub fn subscribe(&mut self) -> flume::Receiver<SessionEvent> {
        let (tx, rx) = flume::bounded(self.options.event_capacity.max(1));
        self.events = Some(tx);
        rx
    }

    #[instrument(skip(self))]
    pub fn start_preview(&mut self) -> Result<(), SessionError> {
        self.expect(&[SessionState::Idle], "start preview")?;
        self.driver.configure(&self.config).map_err(|err| match err {
            DriverError::Rejected(reason) => SessionError::Config(ConfigError::Rejected(reason)),
            other => SessionError::Driver(other),
        })?;
        self.preview = Some(self.driver.start_preview()?);
        self.preview_fps = FpsMeter::new(30);
        self.transition(SessionState::Previewing);
        Ok(())
    }

    /// Pull the frames that arrived since the last tick, discard them and report live-view status
    pub fn preview_tick(&mut self) -> Result<Option<PreviewStatus>, SessionError> {
        self.expect(&[SessionState::Previewing], "refresh preview")?;
        let Some(stream) = self.preview.as_ref() else {
            return Ok(None);
        };

        let mut latest = None;
        for frame in stream.try_iter() {
            self.preview_fps.record(frame.timestamp);
            latest = Some((frame.timestamp, frame.image.width, frame.image.height));
        }
        let Some((timestamp, width, height)) = latest else {
            if stream.is_disconnected() {
                return Err(DriverError::Disconnected.into());
            }
            return Ok(None);
        };

        let status = PreviewStatus {
            timestamp,
            state: self.state,
            width,
            height,
            measured_frame_rate: self.preview_fps.fps(),
        };
        self.emit(SessionEvent::Preview(status.clone()));
        Ok(Some(status))
    }

    #[instrument(skip(self))]
    pub fn stop_preview(&mut self) -> Result<(), SessionError> {
        self.expect(&[SessionState::Previewing], "stop preview")?;
        self.preview = None;
        self.driver.stop()?;
        self.transition(SessionState::Idle);
        Ok(())
    }

    /// Stop live view, capture `target_frames` and fill the frame buffer.
    ///
    /// Polls the device at `poll_interval_ms` until the burst is complete, then drains it
    /// in one shot and writes the metadata sidecar. Any device fault or timeout releases
    /// the device and leaves no buffer behind.
    #[instrument(skip(self), fields(target = self.config.target_frames))]
    pub async fn acquire(&mut self) -> Result<&AcquisitionSnapshot, SessionError> {
        self.expect(&[SessionState::Previewing], "acquire")?;
        let target = self.config.target_frames;
        self.available = 0;

        self.preview = None;
        if let Err(err) = self.driver.stop() {
            return Err(self.abort(err));
        }
        if let Err(err) = self.driver.start_capture(target) {
            return Err(self.abort(err));
        }
        self.transition(SessionState::Acquiring);

        let started = Instant::now();
        let limit = self.options.acquisition_timeout_ms.map(Duration::from_millis);
        let wait = self.wait_for_frames(target);
        let outcome = match limit {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
            None => Some(wait.await),
        };
        match outcome {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(self.abort(err)),
            None => {
                let available = self.available;
                error!(available, target, "acquisition timed out");
                self.release();
                return Err(SessionError::AcquisitionTimeout {
                    elapsed: started.elapsed(),
                    available,
                    target,
                });
            }
        }
        histogram!("strobe_acquisition_seconds").record(started.elapsed().as_secs_f64());

        let drained = match self.driver.drain() {
            Ok(drained) => drained,
            Err(err) => return Err(self.abort(err)),
        };
        match self.complete(drained, target) {
            Ok(snapshot) => {
                info!(
                    frames = target,
                    fps = snapshot.report.measured_frame_rate,
                    sidecar = %snapshot.sidecar_path.display(),
                    "burst drained"
                );
                let sidecar = snapshot.sidecar_path.clone();
                self.snapshot = Some(snapshot);
                self.transition(SessionState::Drained);
                self.emit(SessionEvent::Drained {
                    frames: target,
                    sidecar,
                });
                self.snapshot
                    .as_ref()
                    .ok_or(SessionError::InvalidTransition {
                        action: "snapshot",
                        state: self.state,
                    })
            }
            Err(err) => {
                error!("failed to complete burst: {err}");
                self.release();
                Err(err)
            }
        }
    }

    async fn wait_for_frames(&mut self, target: usize) -> Result<(), DriverError> {
        let period = Duration::from_millis(self.options.poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let available = self.driver.frames_available()?;
            counter!("strobe_poll_ticks_total").increment(1);
            if available != self.available {
                debug!(available, target, "acquisition progress");
            }
            self.available = available;
            self.emit(SessionEvent::Progress { available, target });
            if available >= target {
                return Ok(());
            }
        }
    }

    fn complete(
        &mut self,
        drained: DrainedFrames,
        target: usize,
    ) -> Result<AcquisitionSnapshot, SessionError> {
        let images = drained.images.len();
        if images < target || drained.timestamps.len() != images || drained.chunks.len() != images {
            return Err(SessionError::AcquisitionAborted {
                available: images,
                target,
                source: DriverError::Transport(format!(
                    "drain returned {images} frames, {} timestamps, {} metadata records",
                    drained.timestamps.len(),
                    drained.chunks.len()
                )),
            });
        }

        let (buffer, metadata_errors) = self.fill_buffer(drained, target)?;
        let report = self.driver.report()?;
        let (width, height, pixel_format) = buffer.frames().first().map_or_else(
            || {
                let (width, height) = self.config.output_dimensions();
                (width, height, self.config.pixel_format)
            },
            |frame| (frame.width(), frame.height(), frame.format()),
        );

        let output_dir = self.options.output_dir.clone();
        fs::create_dir_all(&output_dir).map_err(|source| SessionError::Sidecar {
            path: output_dir.clone(),
            source,
        })?;
        let prefix = utils::unique_artifact_prefix(&output_dir);
        let sidecar_path = output_dir.join(format!("{prefix}_meta.json"));
        let sidecar = Sidecar::new(
            &prefix,
            &self.config,
            &report,
            buffer.frames(),
            metadata_errors.clone(),
        );
        sidecar
            .write(&sidecar_path)
            .map_err(|source| SessionError::Sidecar {
                path: sidecar_path.clone(),
                source,
            })?;

        counter!("strobe_frames_drained_total").increment(target as u64);
        counter!("strobe_metadata_errors_total").increment(metadata_errors.len() as u64);
        gauge!("strobe_measured_frame_rate").set(report.measured_frame_rate);

        self.buffer = Some(buffer);
        Ok(AcquisitionSnapshot {
            prefix,
            output_dir,
            sidecar_path,
            acquisition: self.config.clone(),
            report,
            width,
            height,
            pixel_format,
            metadata_errors: metadata_errors.len(),
        })
    }

    fn fill_buffer(
        &self,
        drained: DrainedFrames,
        target: usize,
    ) -> Result<(FrameBuffer, Vec<MalformedMetadata>), SessionError> {
        let mut buffer = FrameBuffer::with_capacity(target);
        let mut metadata_errors = Vec::new();
        let records = drained
            .images
            .into_iter()
            .zip(drained.timestamps)
            .zip(drained.chunks)
            .enumerate();

        for (index, ((image, timestamp), raw)) in records {
            if image.data.len() != image.expected_len() {
                return Err(SessionError::AcquisitionAborted {
                    available: index,
                    target,
                    source: DriverError::Transport(format!(
                        "frame {index} carries {} bytes, expected {}",
                        image.data.len(),
                        image.expected_len()
                    )),
                });
            }
            let meta = match self.options.metadata_policy {
                MetadataPolicy::Strict => metadata::decode(index, &raw)?,
                MetadataPolicy::Lenient => {
                    let (chunk, errors) = metadata::decode_lenient(index, &raw);
                    for err in &errors {
                        warn!("{err}");
                    }
                    metadata_errors.extend(errors);
                    chunk
                }
            };
            buffer.append(Frame {
                image,
                timestamp,
                meta,
            })?;
        }
        Ok((buffer, metadata_errors))
    }

    /// Hand the burst to `exporter` and close the session.
    ///
    /// The exporter's bit-depth check runs before the buffer is consumed, so a refused
    /// export leaves the session Drained and another exporter can be tried.
    #[instrument(skip(self, exporter), fields(exporter = exporter.name()))]
    pub fn export(&mut self, exporter: &Exporter) -> Result<ExportReport, SessionError> {
        self.expect(&[SessionState::Drained], "export")?;
        let snapshot = self.snapshot.clone().ok_or(SessionError::InvalidTransition {
            action: "export",
            state: self.state,
        })?;
        exporter.check(&snapshot)?;

        let frames = self
            .buffer
            .as_mut()
            .ok_or(crate::error::BufferError::AlreadyConsumed)?
            .consume()?;
        let result = exporter.export(Burst { frames, snapshot });
        if let Ok(report) = &result {
            info!(
                path = %report.path.display(),
                bytes = report.bytes,
                "export finished"
            );
            self.emit(SessionEvent::ExportFinished(report.clone()));
        }
        self.release();
        Ok(result?)
    }

    /// Release the device; safe from any state and idempotent
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let result = self.shutdown();
        self.transition(SessionState::Closed);
        Ok(result?)
    }

    fn shutdown(&mut self) -> Result<(), DriverError> {
        self.preview = None;
        self.buffer = None;
        let stopped = self.driver.stop();
        let closed = self.driver.close();
        stopped.and(closed)
    }

    /// Release after a failure, logging instead of masking the original error
    fn release(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(err) = self.shutdown() {
            warn!("failed to release device: {err}");
        }
        self.transition(SessionState::Closed);
    }

    fn abort(&mut self, source: DriverError) -> SessionError {
        let available = self.available;
        let target = self.config.target_frames;
        error!(available, target, "acquisition aborted: {source}");
        counter!("strobe_acquisitions_aborted_total").increment(1);
        self.release();
        SessionError::AcquisitionAborted {
            available,
            target,
            source,
        }
    }

    fn expect(&self, allowed: &[SessionState], action: &'static str) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // Observers are advisory; a slow or absent display never stalls acquisition
            let _ = events.try_send(event);
        }
    }
}

impl<D: CameraDriver> Drop for Session<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::driver::DeviceLimits;
    use crate::capture::frame::Image;
    use crate::capture::sim::{SimulatedCamera, SimulatorConfig};
    use crate::Roi;

    /// Simulated camera whose drain is altered before the session sees it
    struct Tampered {
        inner: SimulatedCamera,
        tamper: fn(&mut DrainedFrames),
    }

    impl CameraDriver for Tampered {
        fn limits(&self) -> DeviceLimits {
            self.inner.limits()
        }

        fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), DriverError> {
            self.inner.configure(config)
        }

        fn start_preview(&mut self) -> Result<FrameStream, DriverError> {
            self.inner.start_preview()
        }

        fn start_capture(&mut self, count: usize) -> Result<(), DriverError> {
            self.inner.start_capture(count)
        }

        fn frames_available(&mut self) -> Result<usize, DriverError> {
            self.inner.frames_available()
        }

        fn drain(&mut self) -> Result<DrainedFrames, DriverError> {
            let mut drained = self.inner.drain()?;
            (self.tamper)(&mut drained);
            Ok(drained)
        }

        fn report(&self) -> Result<AcquisitionReport, DriverError> {
            self.inner.report()
        }

        fn stop(&mut self) -> Result<(), DriverError> {
            self.inner.stop()
        }

        fn close(&mut self) -> Result<(), DriverError> {
            self.inner.close()
        }
    }

    fn fast_camera(sim: SimulatorConfig) -> SimulatedCamera {
        SimulatedCamera::new(SimulatorConfig {
            realtime: false,
            ..sim
        })
    }

    fn config(target: usize) -> AcquisitionConfig {
        AcquisitionConfig {
            roi: Roi::new(0, 0, 16, 12),
            target_frames: target,
            ..AcquisitionConfig::default()
        }
    }

    fn options(dir: &std::path::Path) -> SessionConfig {
        SessionConfig {
            poll_interval_ms: 1,
            output_dir: dir.to_path_buf(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_open_rejects_out_of_bounds_roi() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bad = config(4);
        bad.roi = Roi::new(1400, 0, 64, 12);
        let camera = fast_camera(SimulatorConfig::default());
        let result = Session::open(camera, bad, options(dir.path()));
        assert!(matches!(
            result,
            Err(SessionError::Config(ConfigError::RoiOutOfBounds { .. }))
        ));
    }

    #[test]
    fn test_acquire_requires_preview() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session =
            Session::open(fast_camera(SimulatorConfig::default()), config(4), options(dir.path()))
                .expect("open");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        let result = runtime.block_on(session.acquire());
        assert!(matches!(
            result,
            Err(SessionError::InvalidTransition {
                state: SessionState::Idle,
                ..
            })
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_preview_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session =
            Session::open(fast_camera(SimulatorConfig::default()), config(4), options(dir.path()))
                .expect("open");
        let events = session.subscribe();

        session.start_preview().expect("start preview");
        assert_eq!(session.state(), SessionState::Previewing);
        assert!(matches!(
            session.start_preview(),
            Err(SessionError::InvalidTransition { .. })
        ));

        let status = loop {
            if let Some(status) = session.preview_tick().expect("tick") {
                break status;
            }
            std::thread::sleep(Duration::from_millis(2));
        };
        assert_eq!((status.width, status.height), (16, 12));
        assert_eq!(status.state, SessionState::Previewing);

        session.stop_preview().expect("stop preview");
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.buffer().is_none());

        let states: Vec<_> = events
            .try_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SessionState::Previewing, SessionState::Idle]);
    }

    #[tokio::test]
    async fn test_acquire_fills_buffer_and_writes_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session =
            Session::open(fast_camera(SimulatorConfig::default()), config(12), options(dir.path()))
                .expect("open");
        session.start_preview().expect("preview");

        let snapshot = session.acquire().await.expect("acquire").clone();
        assert_eq!(session.state(), SessionState::Drained);
        assert!(snapshot.sidecar_path.exists());
        assert_eq!((snapshot.width, snapshot.height), (16, 12));

        let buffer = session.buffer().expect("buffer while drained");
        assert!(buffer.is_complete());
        assert_eq!(buffer.len(), 12);
        let ids: Vec<_> = buffer
            .frames()
            .iter()
            .map(|frame| frame.meta.frame_id)
            .collect();
        assert_eq!(ids, (0..12).map(Some).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_strict_policy_aborts_on_malformed_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = fast_camera(SimulatorConfig {
            corrupt_chunk: Some(2),
            ..SimulatorConfig::default()
        });
        let mut strict = options(dir.path());
        strict.metadata_policy = MetadataPolicy::Strict;
        let mut session = Session::open(camera, config(5), strict).expect("open");
        session.start_preview().expect("preview");

        let err = session.acquire().await.expect_err("strict decoding fails");
        assert!(matches!(err, SessionError::Metadata(MalformedMetadata { index: 2, .. })));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.buffer().is_none());
        assert!(session.driver().is_closed());
    }

    #[tokio::test]
    async fn test_lenient_policy_keeps_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = fast_camera(SimulatorConfig {
            corrupt_chunk: Some(2),
            ..SimulatorConfig::default()
        });
        let mut session = Session::open(camera, config(5), options(dir.path())).expect("open");
        session.start_preview().expect("preview");

        let snapshot = session.acquire().await.expect("lenient acquire").clone();
        assert_eq!(snapshot.metadata_errors, 1);
        let frames = session.buffer().expect("buffer").frames();
        assert_eq!(frames[2].meta.gain_db, None);
        assert_eq!(frames[2].meta.frame_id, Some(2));
        assert!(frames[1].meta.is_complete());
        assert!(frames[3].meta.is_complete());
    }

    #[test]
    fn test_close_from_preview_releases_device() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session =
            Session::open(fast_camera(SimulatorConfig::default()), config(4), options(dir.path()))
                .expect("open");
        session.start_preview().expect("preview");
        session.close().expect("close");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.driver().is_closed());
        session.close().expect("second close is a no-op");
        assert!(matches!(
            session.start_preview(),
            Err(SessionError::InvalidTransition {
                state: SessionState::Closed,
                ..
            })
        ));
    }

    async fn acquire_tampered(
        dir: &std::path::Path,
        target: usize,
        tamper: fn(&mut DrainedFrames),
    ) -> (Session<Tampered>, SessionError) {
        let camera = Tampered {
            inner: fast_camera(SimulatorConfig::default()),
            tamper,
        };
        let mut session = Session::open(camera, config(target), options(dir)).expect("open");
        session.start_preview().expect("preview");
        let err = session.acquire().await.expect_err("tampered drain must fail");
        (session, err)
    }

    fn assert_discarded(session: &Session<Tampered>, dir: &std::path::Path) {
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.buffer().is_none());
        assert!(session.snapshot().is_none());
        assert!(session.driver().inner.is_closed());
        let written = fs::read_dir(dir).expect("read dir").count();
        assert_eq!(written, 0, "no sidecar or artifact may be written");
    }

    #[tokio::test]
    async fn test_short_drain_is_never_truncated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, err) = acquire_tampered(dir.path(), 1000, |drained| {
            drained.images.truncate(999);
            drained.timestamps.truncate(999);
            drained.chunks.truncate(999);
        })
        .await;
        assert!(matches!(
            err,
            SessionError::AcquisitionAborted {
                available: 999,
                target: 1000,
                source: DriverError::Transport(_),
            }
        ));
        assert_discarded(&session, dir.path());
    }

    #[tokio::test]
    async fn test_misaligned_drain_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, err) = acquire_tampered(dir.path(), 20, |drained| {
            drained.timestamps.pop();
        })
        .await;
        assert!(matches!(
            err,
            SessionError::AcquisitionAborted { target: 20, .. }
        ));
        assert_discarded(&session, dir.path());

        let dir = tempfile::tempdir().expect("tempdir");
        let (session, err) = acquire_tampered(dir.path(), 20, |drained| {
            drained.chunks.pop();
        })
        .await;
        assert!(matches!(err, SessionError::AcquisitionAborted { .. }));
        assert_discarded(&session, dir.path());
    }

    #[tokio::test]
    async fn test_wrong_payload_size_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, err) = acquire_tampered(dir.path(), 10, |drained| {
            let bad = &drained.images[3];
            drained.images[3] = Image::new(bad.width, bad.height, bad.format, vec![0u8; 5]);
        })
        .await;
        assert!(matches!(
            err,
            SessionError::AcquisitionAborted {
                available: 3,
                target: 10,
                ..
            }
        ));
        assert_discarded(&session, dir.path());
    }

    #[tokio::test]
    async fn test_close_from_drained_discards_buffer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session =
            Session::open(fast_camera(SimulatorConfig::default()), config(6), options(dir.path()))
                .expect("open");
        session.start_preview().expect("preview");
        let snapshot = session.acquire().await.expect("acquire");
        let sidecar = snapshot.sidecar_path.clone();
        assert_eq!(session.state(), SessionState::Drained);

        session.close().expect("close");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.buffer().is_none());
        assert!(session.driver().is_closed());
        assert!(sidecar.exists());
        assert!(matches!(
            session.export(&Exporter::ImageStack(crate::export::ImageStackExporter)),
            Err(SessionError::InvalidTransition {
                state: SessionState::Closed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_back_to_back_bursts_keep_separate_sidecars() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sidecars = Vec::new();
        for _ in 0..2 {
            let camera = fast_camera(SimulatorConfig::default());
            let mut session = Session::open(camera, config(2), options(dir.path())).expect("open");
            session.start_preview().expect("preview");
            let snapshot = session.acquire().await.expect("acquire");
            sidecars.push(snapshot.sidecar_path.clone());
        }
        assert_ne!(sidecars[0], sidecars[1]);
        assert!(sidecars.iter().all(|path| path.exists()));
    }
}
