//! Compressed-video exporter

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::avi::AviWriter;
use super::Burst;
use crate::capture::frame::PixelFormat;
use crate::error::ExportError;

/// JPEG quality of the Motion-JPEG fallback
pub const MJPEG_QUALITY: u8 = 95;

/// Encoder behind the video exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoBackend {
    /// H.264 in MP4 through GStreamer (`gstreamer-pipeline` feature)
    #[default]
    H264,
    /// Intra-only Motion-JPEG in AVI, for builds without GStreamer
    Mjpeg,
}

impl VideoBackend {
    pub fn extension(self) -> &'static str {
        match self {
            Self::H264 => "mp4",
            Self::Mjpeg => "avi",
        }
    }
}

/// Writes a burst as a lossy clip at the playback rate.
///
/// The container rate is for viewing only; acquisition timing lives in the sidecar.
/// Encoder quality is fixed high and not configurable.
#[derive(Debug, Clone)]
pub struct VideoExporter {
    pub playback_fps: u32,
    pub backend: VideoBackend,
}

impl VideoExporter {
    pub fn check(&self, format: PixelFormat, width: u32, height: u32) -> Result<(), ExportError> {
        if format.bit_depth() != 8 {
            return Err(ExportError::UnsupportedBitDepth {
                exporter: "video",
                bits: format.bit_depth(),
            });
        }
        if !matches!(format.channels(), 1 | 3) {
            return Err(ExportError::UnsupportedChannels {
                exporter: "video",
                channels: format.channels(),
            });
        }
        // 4:2:0 chroma needs even dimensions
        if self.backend == VideoBackend::H264 && (width % 2 != 0 || height % 2 != 0) {
            return Err(ExportError::UnsupportedDimensions {
                exporter: "video",
                width,
                height,
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(backend = ?self.backend, frames = burst.frames.len()))]
    pub fn write(&self, burst: &Burst, path: &Path) -> Result<(), ExportError> {
        match self.backend {
            #[cfg(feature = "gstreamer-pipeline")]
            VideoBackend::H264 => super::gst_video::write_h264(burst, path, self.playback_fps),
            #[cfg(not(feature = "gstreamer-pipeline"))]
            VideoBackend::H264 => Err(ExportError::Pipeline(
                "H.264 export needs the gstreamer-pipeline feature".into(),
            )),
            VideoBackend::Mjpeg => self.write_mjpeg(burst, path),
        }
    }

    fn write_mjpeg(&self, burst: &Burst, path: &Path) -> Result<(), ExportError> {
        let io_err = |source| ExportError::Write {
            path: path.to_path_buf(),
            source,
        };
        let (width, height) = (burst.snapshot.width, burst.snapshot.height);
        let file = File::create(path).map_err(io_err)?;
        let mut avi = AviWriter::new(BufWriter::new(file), width, height, self.playback_fps)
            .map_err(io_err)?;

        let mut jpeg = Vec::new();
        for (index, frame) in burst.frames.iter().enumerate() {
            jpeg.clear();
            JpegEncoder::new_with_quality(&mut jpeg, MJPEG_QUALITY).encode(
                frame.image.samples_u8(),
                frame.width(),
                frame.height(),
                color_type(frame.format()),
            )?;
            avi.write_frame(&jpeg).map_err(io_err)?;

            if (index + 1) % 250 == 0 {
                debug!("encoded {}/{} frames", index + 1, burst.frames.len());
            }
        }

        avi.finish().map_err(io_err)?;
        Ok(())
    }
}

fn color_type(format: PixelFormat) -> ExtendedColorType {
    if format.channels() == 3 {
        ExtendedColorType::Rgb8
    } else {
        ExtendedColorType::L8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporter(backend: VideoBackend) -> VideoExporter {
        VideoExporter {
            playback_fps: 20,
            backend,
        }
    }

    #[test]
    fn test_only_eight_bit_is_accepted() {
        let video = exporter(VideoBackend::H264);
        for format in [PixelFormat::Rgb8, PixelFormat::Mono8, PixelFormat::BayerRg8] {
            video.check(format, 320, 240).expect("8-bit formats encode");
        }
        for format in [PixelFormat::Rgb16, PixelFormat::Mono16, PixelFormat::BayerRg16] {
            assert!(matches!(
                video.check(format, 320, 240),
                Err(ExportError::UnsupportedBitDepth {
                    exporter: "video",
                    bits: 16
                })
            ));
        }
    }

    #[test]
    fn test_h264_needs_even_dimensions() {
        assert!(matches!(
            exporter(VideoBackend::H264).check(PixelFormat::Rgb8, 319, 240),
            Err(ExportError::UnsupportedDimensions {
                width: 319,
                height: 240,
                ..
            })
        ));
        assert!(exporter(VideoBackend::H264).check(PixelFormat::Mono8, 30, 17).is_err());
        exporter(VideoBackend::Mjpeg)
            .check(PixelFormat::Rgb8, 319, 239)
            .expect("MJPEG takes any size");
    }

    #[test]
    fn test_h264_is_the_default_backend() {
        assert_eq!(VideoBackend::default(), VideoBackend::H264);
        assert_eq!(VideoBackend::H264.extension(), "mp4");
        assert_eq!(VideoBackend::Mjpeg.extension(), "avi");
    }
}
