//! End-to-end acquisition scenarios against the simulated camera.

use std::fs;
use std::path::Path;

use strobe::capture::{SimulatedCamera, SimulatorConfig};
use strobe::error::{DriverError, SessionError};
use strobe::export::sidecar::Sidecar;
use strobe::{AcquisitionConfig, Roi, Session, SessionConfig, SessionEvent, SessionState};

fn camera(sim: SimulatorConfig) -> SimulatedCamera {
    SimulatedCamera::new(SimulatorConfig {
        realtime: false,
        ..sim
    })
}

fn acquisition(target: usize) -> AcquisitionConfig {
    AcquisitionConfig {
        roi: Roi::new(560, 420, 320, 240),
        target_frames: target,
        ..AcquisitionConfig::default()
    }
}

fn options(dir: &Path) -> SessionConfig {
    SessionConfig {
        poll_interval_ms: 2,
        output_dir: dir.to_path_buf(),
        ..SessionConfig::default()
    }
}

fn artifacts(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .expect("read output dir")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

#[tokio::test]
async fn test_full_burst_writes_aligned_sidecar() {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = camera(SimulatorConfig::default());
    let mut session =
        Session::open(driver, acquisition(1000), options(dir.path())).expect("open session");
    let events = session.subscribe();
    session.start_preview().expect("preview");

    let snapshot = session.acquire().await.expect("acquire").clone();
    assert_eq!(session.state(), SessionState::Drained);
    assert_eq!((snapshot.width, snapshot.height), (320, 240));

    let buffer = session.buffer().expect("buffer");
    assert_eq!(buffer.len(), 1000);
    assert!(buffer.is_complete());

    let sidecar = Sidecar::read(&snapshot.sidecar_path).expect("sidecar parses");
    assert_eq!(sidecar.frame_count, 1000);
    for series in [
        sidecar.frame_id.len(),
        sidecar.timestamp.len(),
        sidecar.exposure_time.len(),
        sidecar.gain.len(),
        sidecar.black_level.len(),
        sidecar.pixel_format.len(),
    ] {
        assert_eq!(series, 1000);
    }
    for (index, frame) in buffer.frames().iter().enumerate() {
        assert_eq!(sidecar.frame_id[index], frame.meta.frame_id);
        assert_eq!(sidecar.timestamp[index], frame.timestamp);
        assert_eq!(sidecar.exposure_time[index], Some(1000.0));
    }
    assert_eq!(sidecar.effective_roi, Roi::new(560, 420, 320, 240));
    assert_eq!(sidecar.color_space, "sRGB");
    assert!(sidecar.metadata_errors.is_empty());
    assert!(snapshot
        .sidecar_path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == format!("{}_meta.json", snapshot.prefix)));

    let progress: Vec<(usize, usize)> = events
        .try_iter()
        .filter_map(|event| match event {
            SessionEvent::Progress { available, target } => Some((available, target)),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|pair| pair[0].0 <= pair[1].0));
}

#[tokio::test]
async fn test_transport_fault_aborts_without_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sim = SimulatorConfig {
        fail_after: Some(500),
        ..SimulatorConfig::default()
    };
    let mut session =
        Session::open(camera(sim), acquisition(1000), options(dir.path())).expect("open session");
    session.start_preview().expect("preview");

    let err = session.acquire().await.expect_err("fault aborts the burst");
    match err {
        SessionError::AcquisitionAborted {
            available,
            target,
            source: DriverError::Transport(_),
        } => {
            assert_eq!(target, 1000);
            assert!(available <= 500);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.buffer().is_none());
    assert!(session.driver().is_closed());
    assert!(artifacts(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_device_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sim = SimulatorConfig {
        stall_after: Some(3),
        ..SimulatorConfig::default()
    };
    let options = SessionConfig {
        acquisition_timeout_ms: Some(500),
        ..options(dir.path())
    };
    let mut session = Session::open(camera(sim), acquisition(10), options).expect("open session");
    session.start_preview().expect("preview");

    let err = session.acquire().await.expect_err("stall times out");
    assert!(matches!(
        err,
        SessionError::AcquisitionTimeout { target: 10, available, .. } if available <= 3
    ));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.driver().is_closed());
    assert!(artifacts(dir.path()).is_empty());
}

#[test]
fn test_configuration_errors_precede_device_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = acquisition(10);
    config.exposure_us = 5.0;
    let result = Session::open(camera(SimulatorConfig::default()), config, options(dir.path()));
    assert!(matches!(result, Err(SessionError::Config(_))));
    assert!(artifacts(dir.path()).is_empty());
}
