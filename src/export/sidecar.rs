//! Metadata sidecar: the durable record tying exported pixels to acquisition conditions.
//!
//! One JSON document per acquisition with index-aligned per-frame arrays; the schema does not
//! depend on which exporter produced the primary artifact.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::driver::AcquisitionReport;
use crate::capture::frame::{Frame, PixelFormat};
use crate::error::MalformedMetadata;
use crate::{AcquisitionConfig, Roi};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub schema_version: u32,
    pub prefix: String,
    pub color_space: String,
    pub frame_count: usize,
    pub measured_frame_rate: f64,
    pub isp_enabled: bool,
    pub effective_roi: Roi,
    pub requested: AcquisitionConfig,
    pub frame_id: Vec<Option<u64>>,
    /// Arrival times, seconds on the device's monotonic clock
    pub timestamp: Vec<f64>,
    /// Microseconds
    pub exposure_time: Vec<Option<f64>>,
    /// Decibels
    pub gain: Vec<Option<f64>>,
    pub black_level: Vec<Option<f64>>,
    pub pixel_format: Vec<Option<PixelFormat>>,
    pub metadata_errors: Vec<MalformedMetadata>,
}

impl Sidecar {
    pub fn new(
        prefix: &str,
        requested: &AcquisitionConfig,
        report: &AcquisitionReport,
        frames: &[Frame],
        metadata_errors: Vec<MalformedMetadata>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            prefix: prefix.to_owned(),
            color_space: report.color_space.clone(),
            frame_count: frames.len(),
            measured_frame_rate: report.measured_frame_rate,
            isp_enabled: report.isp_enabled,
            effective_roi: report.effective_roi,
            requested: requested.clone(),
            frame_id: frames.iter().map(|frame| frame.meta.frame_id).collect(),
            timestamp: frames.iter().map(|frame| frame.timestamp).collect(),
            exposure_time: frames.iter().map(|frame| frame.meta.exposure_us).collect(),
            gain: frames.iter().map(|frame| frame.meta.gain_db).collect(),
            black_level: frames.iter().map(|frame| frame.meta.black_level).collect(),
            pixel_format: frames.iter().map(|frame| frame.meta.pixel_format).collect(),
            metadata_errors,
        }
    }

    /// Write the document next to its final name and rename it into place
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        super::replace_file(path, |part| {
            let mut writer = BufWriter::new(File::create(part)?);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.write_all(b"\n")?;
            writer.flush()
        })
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
