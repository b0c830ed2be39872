//! Burst exporters.
//!
//! Both variants consume the same [`Burst`] and write one primary artifact next to the
//! sidecar the session already wrote. Output goes to a `.part` file that is renamed once
//! complete, so a failed export never leaves a truncated artifact behind.

pub mod avi;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_video;
pub mod sidecar;
pub mod tiff_stack;
pub mod video;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capture::frame::Frame;
use crate::error::ExportError;
use crate::pipeline::session::AcquisitionSnapshot;
use crate::ExportConfig;

pub use tiff_stack::ImageStackExporter;
pub use video::{VideoBackend, VideoExporter};

/// A drained burst in exporter ownership
#[derive(Debug)]
pub struct Burst {
    pub frames: Vec<Frame>,
    pub snapshot: AcquisitionSnapshot,
}

/// Operator's choice of primary artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Video,
    ImageStack,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub exporter: &'static str,
    pub path: PathBuf,
    pub sidecar_path: PathBuf,
    pub frames: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// The two encoders sharing one buffer type
#[derive(Debug, Clone)]
pub enum Exporter {
    Video(VideoExporter),
    ImageStack(ImageStackExporter),
}

impl Exporter {
    pub fn from_config(config: &ExportConfig, playback_fps: u32) -> Self {
        match config.format {
            ExportFormat::Video => Self::Video(VideoExporter {
                playback_fps,
                backend: config.video_backend,
            }),
            ExportFormat::ImageStack => Self::ImageStack(ImageStackExporter),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Video(_) => "video",
            Self::ImageStack(_) => "image-stack",
        }
    }

    /// Refuse bursts this exporter cannot encode, before anything is consumed
    pub fn check(&self, snapshot: &AcquisitionSnapshot) -> Result<(), ExportError> {
        match self {
            Self::Video(video) => {
                video.check(snapshot.pixel_format, snapshot.width, snapshot.height)
            }
            Self::ImageStack(stack) => stack.check(snapshot.pixel_format),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Video(video) => video.backend.extension(),
            Self::ImageStack(_) => "tif",
        }
    }

    pub fn artifact_path(&self, snapshot: &AcquisitionSnapshot) -> PathBuf {
        snapshot
            .output_dir
            .join(format!("{}.{}", snapshot.prefix, self.extension()))
    }

    pub fn export(&self, burst: Burst) -> Result<ExportReport, ExportError> {
        let started = Instant::now();
        validate_burst(&burst)?;
        self.check(&burst.snapshot)?;

        let path = self.artifact_path(&burst.snapshot);
        let bytes = write_via_part_file(&path, |part| match self {
            Self::Video(video) => video.write(&burst, part),
            Self::ImageStack(stack) => stack.write(&burst, part),
        })?;

        let elapsed = started.elapsed();
        counter!("strobe_export_bytes_total", "exporter" => self.name()).increment(bytes);
        histogram!("strobe_export_seconds", "exporter" => self.name())
            .record(elapsed.as_secs_f64());
        Ok(ExportReport {
            exporter: self.name(),
            path,
            sidecar_path: burst.snapshot.sidecar_path.clone(),
            frames: burst.frames.len(),
            bytes,
            elapsed,
        })
    }
}

fn validate_burst(burst: &Burst) -> Result<(), ExportError> {
    let expected = burst.snapshot.acquisition.target_frames;
    if burst.frames.len() != expected {
        return Err(ExportError::IncompleteBurst {
            found: burst.frames.len(),
            expected,
        });
    }
    for (index, frame) in burst.frames.iter().enumerate() {
        if frame.image.data.len() != frame.image.expected_len() {
            return Err(ExportError::PayloadSize {
                index,
                found: frame.image.data.len(),
                expected: frame.image.expected_len(),
            });
        }
    }
    Ok(())
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

fn discard_part(part: &Path) {
    if part.exists() {
        if let Err(err) = fs::remove_file(part) {
            warn!("failed to remove {}: {err}", part.display());
        }
    }
}

/// Run `write` against a temporary sibling of `path` and move it into place on success
fn write_via_part_file<F>(path: &Path, write: F) -> Result<u64, ExportError>
where
    F: FnOnce(&Path) -> Result<(), ExportError>,
{
    let part = part_path(path);
    if let Err(err) = write(&part) {
        discard_part(&part);
        return Err(err);
    }

    let io_err = |source| ExportError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::rename(&part, path).map_err(io_err)?;
    Ok(fs::metadata(path).map_err(io_err)?.len())
}

/// Replace `path` in one step: write a `.part` sibling, then rename it over the target
pub(crate) fn replace_file<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let part = part_path(path);
    if let Err(err) = write(&part).and_then(|()| fs::rename(&part, path)) {
        discard_part(&part);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_keeps_extension() {
        assert_eq!(
            part_path(Path::new("/tmp/out/20261016_x.tif")),
            PathBuf::from("/tmp/out/20261016_x.tif.part")
        );
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("burst.avi");
        let result = write_via_part_file(&path, |part| {
            fs::write(part, b"half a file").expect("write part");
            Err(ExportError::Pipeline("encoder died".into()))
        });
        assert!(result.is_err());
        assert!(!path.exists());
        assert!(!part_path(&path).exists());
    }

    #[test]
    fn test_successful_write_is_renamed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("burst.tif");
        let bytes = write_via_part_file(&path, |part| {
            fs::write(part, b"0123456789").map_err(|source| ExportError::Write {
                path: part.to_path_buf(),
                source,
            })
        })
        .expect("write succeeds");
        assert_eq!(bytes, 10);
        assert!(path.exists());
        assert!(!part_path(&path).exists());
    }

    #[test]
    fn test_exporter_names_and_extensions() {
        let config = ExportConfig::default();
        let video = Exporter::from_config(&config, 20);
        assert_eq!((video.name(), video.extension()), ("video", "mp4"));

        let stack = Exporter::from_config(
            &ExportConfig {
                format: ExportFormat::ImageStack,
                ..config
            },
            20,
        );
        assert_eq!((stack.name(), stack.extension()), ("image-stack", "tif"));
    }

    #[test]
    fn test_replace_file_keeps_old_content_on_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("burst_meta.json");
        fs::write(&path, b"{\"complete\":true}").expect("seed");

        let result = replace_file(&path, |part| {
            fs::write(part, b"{\"comp")?;
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        });
        assert!(result.is_err());
        assert_eq!(fs::read(&path).expect("read"), b"{\"complete\":true}");
        assert!(!part_path(&path).exists());

        replace_file(&path, |part| fs::write(part, b"{}")).expect("replace");
        assert_eq!(fs::read(&path).expect("read"), b"{}");
        assert!(!part_path(&path).exists());
    }
}
