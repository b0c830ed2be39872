//! Post-hoc timing diagnostics.
//!
//! Compares the intervals between arrival timestamps against the exposure of each frame and
//! the ideal period implied by the frame rate. Everything here is a pure function of the
//! sidecar arrays; writing the series out as CSV is left to the caller.

use std::io::{self, Write};

use serde::Serialize;

use crate::error::DiagnosticsError;
use crate::export::sidecar::Sidecar;

/// Intervals longer than this many ideal periods count as a suspected drop
const DROP_FACTOR: f64 = 1.5;

/// The three series, one entry per successive frame pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSeries {
    /// Arrival-timestamp differences, milliseconds
    pub intervals_ms: Vec<f64>,
    /// Exposure of the later frame of each pair, milliseconds
    pub exposure_ms: Vec<Option<f64>>,
    /// Constant `1000 / frame_rate`, one entry per interval
    pub ideal_ms: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSummary {
    pub frames: usize,
    pub frame_rate: f64,
    pub ideal_interval_ms: f64,
    pub median_interval_ms: f64,
    pub mean_interval_ms: f64,
    pub stddev_interval_ms: f64,
    pub min_interval_ms: f64,
    pub max_interval_ms: f64,
    pub mean_exposure_ms: Option<f64>,
    /// Frames per second implied by first and last timestamp
    pub effective_fps: f64,
    /// Intervals exceeding 1.5 ideal periods
    pub long_intervals: usize,
    /// Frames missing according to gaps in the frame id sequence
    pub frame_id_gaps: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingReport {
    pub series: TimingSeries,
    pub summary: TimingSummary,
}

impl TimingReport {
    /// Compute the series and summary.
    ///
    /// `timestamps` are in seconds, `exposures_us` in microseconds, both with one entry per
    /// frame.
    pub fn compute(
        timestamps: &[f64],
        exposures_us: &[Option<f64>],
        frame_rate: f64,
        frame_count: usize,
    ) -> Result<Self, DiagnosticsError> {
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(DiagnosticsError::InvalidFrameRate(frame_rate));
        }
        for found in [timestamps.len(), exposures_us.len()] {
            if found != frame_count {
                return Err(DiagnosticsError::LengthMismatch {
                    expected: frame_count,
                    found,
                });
            }
        }
        if frame_count < 2 {
            return Err(DiagnosticsError::TooFewFrames(frame_count));
        }

        let ideal = 1000.0 / frame_rate;
        let intervals_ms: Vec<f64> = timestamps
            .windows(2)
            .map(|pair| (pair[1] - pair[0]) * 1000.0)
            .collect();
        let exposure_ms: Vec<Option<f64>> = exposures_us[1..]
            .iter()
            .map(|us| us.map(|us| us / 1000.0))
            .collect();
        let ideal_ms = vec![ideal; intervals_ms.len()];

        let known: Vec<f64> = exposures_us.iter().flatten().map(|us| us / 1000.0).collect();
        let mean_exposure_ms = (!known.is_empty()).then(|| mean(&known));

        let span = timestamps[frame_count - 1] - timestamps[0];
        let summary = TimingSummary {
            frames: frame_count,
            frame_rate,
            ideal_interval_ms: ideal,
            median_interval_ms: median(&intervals_ms),
            mean_interval_ms: mean(&intervals_ms),
            stddev_interval_ms: stddev(&intervals_ms),
            min_interval_ms: intervals_ms.iter().copied().fold(f64::INFINITY, f64::min),
            max_interval_ms: intervals_ms
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max),
            mean_exposure_ms,
            effective_fps: if span > 0.0 {
                (frame_count - 1) as f64 / span
            } else {
                0.0
            },
            long_intervals: intervals_ms
                .iter()
                .filter(|&&dt| dt > ideal * DROP_FACTOR)
                .count(),
            frame_id_gaps: 0,
        };

        Ok(Self {
            series: TimingSeries {
                intervals_ms,
                exposure_ms,
                ideal_ms,
            },
            summary,
        })
    }

    /// Diagnose a recorded acquisition against its measured frame rate
    pub fn from_sidecar(sidecar: &Sidecar) -> Result<Self, DiagnosticsError> {
        let mut report = Self::compute(
            &sidecar.timestamp,
            &sidecar.exposure_time,
            sidecar.measured_frame_rate,
            sidecar.frame_count,
        )?;
        report.summary.frame_id_gaps = frame_id_gaps(&sidecar.frame_id);
        Ok(report)
    }

    /// Write the three series as CSV, one row per interval
    pub fn write_csv<W: Write>(&self, mut out: W) -> io::Result<()> {
        writeln!(out, "interval,interval_ms,exposure_ms,ideal_ms")?;
        let series = &self.series;
        for (i, (interval, ideal)) in series.intervals_ms.iter().zip(&series.ideal_ms).enumerate() {
            match series.exposure_ms[i] {
                Some(exposure) => {
                    writeln!(out, "{},{interval:.6},{exposure:.6},{ideal:.6}", i + 1)?
                }
                None => writeln!(out, "{},{interval:.6},,{ideal:.6}", i + 1)?,
            }
        }
        out.flush()
    }
}

/// Count ids skipped between successive known frame ids
pub fn frame_id_gaps(ids: &[Option<u64>]) -> u64 {
    let known: Vec<u64> = ids.iter().flatten().copied().collect();
    known
        .windows(2)
        .map(|pair| pair[1].saturating_sub(pair[0]).saturating_sub(1))
        .sum()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64]) -> f64 {
    let mean = mean(values);
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
