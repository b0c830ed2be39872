use std::collections::VecDeque;
use std::path::Path;

use time::macros::format_description;
use time::OffsetDateTime;

/// Timestamp-derived prefix shared by every artifact of one acquisition
pub fn artifact_prefix() -> String {
    let format =
        format_description!("[year][month][day]_[hour][minute][second]_[subsecond digits:3]");
    let now = OffsetDateTime::now_utc();
    now.format(&format)
        .unwrap_or_else(|_| format!("{}", now.unix_timestamp_nanos() / 1_000_000))
}

/// [`artifact_prefix`] that no earlier acquisition in `dir` has claimed
pub fn unique_artifact_prefix(dir: &Path) -> String {
    next_free_prefix(dir, &artifact_prefix())
}

/// A prefix is claimed once its sidecar exists; clashes get a `_N` suffix
fn next_free_prefix(dir: &Path, base: &str) -> String {
    let mut prefix = base.to_owned();
    let mut seq = 0;
    while dir.join(format!("{prefix}_meta.json")).exists() {
        seq += 1;
        prefix = format!("{base}_{seq}");
    }
    prefix
}

/// Rolling frame-rate estimate over the last `window` timestamps
#[derive(Debug, Clone)]
pub struct FpsMeter {
    stamps: VecDeque<f64>,
    window: usize,
}

impl FpsMeter {
    pub fn new(window: usize) -> Self {
        Self {
            stamps: VecDeque::with_capacity(window.max(2)),
            window: window.max(2),
        }
    }

    pub fn record(&mut self, timestamp: f64) {
        if self.stamps.len() == self.window {
            self.stamps.pop_front();
        }
        self.stamps.push_back(timestamp);
    }

    pub fn fps(&self) -> f64 {
        match (self.stamps.front(), self.stamps.back()) {
            (Some(first), Some(last)) if last > first => {
                (self.stamps.len() - 1) as f64 / (last - first)
            }
            _ => 0.0,
        }
    }
}

#[cfg(feature = "v4l2")]
pub use detect::{auto_detect_device, FoundDevice};

#[cfg(feature = "v4l2")]
mod detect {
    use serde::{Deserialize, Serialize};
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device};

    use crate::capture::v4l2::fourcc_to_format;
    use crate::capture::PixelFormat;
    use crate::error::DriverError;

    // Detected capture device info
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FoundDevice {
        pub path: String,
        pub format: PixelFormat,
    }

    /// Auto-detect the first V4L2 node that streams a raw format we can buffer
    pub fn auto_detect_device() -> Result<FoundDevice, DriverError> {
        use std::path::Path;

        info!("Auto-detecting capture devices...");

        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }
            if let Ok(formats) = dev.enum_formats() {
                if let Some(format) = formats.iter().find_map(|fmt| fourcc_to_format(fmt.fourcc)) {
                    info!("Found {} device: {} - {}", format, path, caps.card);
                    return Ok(FoundDevice { path, format });
                }
            }
        }

        Err(DriverError::NotReady("no suitable capture device found".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_sortable_timestamp() {
        let prefix = artifact_prefix();
        assert_eq!(prefix.len(), "20261016_142233_123".len());
        assert!(prefix.chars().all(|c| c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_claimed_prefix_gets_sequence_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = "20261016_142233_123";
        assert_eq!(next_free_prefix(dir.path(), base), base);

        std::fs::write(dir.path().join(format!("{base}_meta.json")), b"{}").expect("claim");
        assert_eq!(next_free_prefix(dir.path(), base), format!("{base}_1"));

        std::fs::write(dir.path().join(format!("{base}_1_meta.json")), b"{}").expect("claim");
        assert_eq!(next_free_prefix(dir.path(), base), format!("{base}_2"));
    }

    #[test]
    fn test_fps_meter_window() {
        let mut meter = FpsMeter::new(3);
        assert_eq!(meter.fps(), 0.0);
        for i in 0..10 {
            meter.record(i as f64 * 0.01);
        }
        assert!((meter.fps() - 100.0).abs() < 1e-9);
    }
}
