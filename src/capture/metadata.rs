//! Per-frame chunk metadata: raw driver records and their typed decoding

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;
use crate::error::MalformedMetadata;

pub const FRAME_ID: &str = "ChunkFrameID";
pub const EXPOSURE_TIME: &str = "ChunkExposureTime";
pub const GAIN: &str = "ChunkGain";
pub const BLACK_LEVEL: &str = "ChunkBlackLevel";
pub const PIXEL_FORMAT: &str = "ChunkPixelFormat";

/// Value of a single chunk field as reported by the driver
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Raw metadata record for one frame, keyed by chunk name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawChunk {
    fields: BTreeMap<String, ChunkValue>,
}

impl RawChunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: ChunkValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: ChunkValue) {
        self.fields.insert(name.to_owned(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<ChunkValue> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ChunkValue> {
        self.fields.get(name)
    }
}

/// How a malformed chunk affects the batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataPolicy {
    /// Abort the drain on the first malformed record
    Strict,
    /// Keep the frame, leave the bad field empty and record the failure
    #[default]
    Lenient,
}

/// Decoded chunk metadata.
///
/// Fields are decoded independently; a field is `None` only when its raw value was missing
/// or unusable under [`MetadataPolicy::Lenient`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataChunk {
    pub frame_id: Option<u64>,
    pub exposure_us: Option<f64>,
    pub gain_db: Option<f64>,
    pub black_level: Option<f64>,
    pub pixel_format: Option<PixelFormat>,
}

impl MetadataChunk {
    pub fn is_complete(&self) -> bool {
        self.frame_id.is_some()
            && self.exposure_us.is_some()
            && self.gain_db.is_some()
            && self.black_level.is_some()
            && self.pixel_format.is_some()
    }
}

/// Decode the record of frame `index`, failing on the first bad field
pub fn decode(index: usize, raw: &RawChunk) -> Result<MetadataChunk, MalformedMetadata> {
    Ok(MetadataChunk {
        frame_id: Some(frame_id(index, raw)?),
        exposure_us: Some(number(index, raw, EXPOSURE_TIME)?),
        gain_db: Some(number(index, raw, GAIN)?),
        black_level: Some(number(index, raw, BLACK_LEVEL)?),
        pixel_format: Some(pixel_format(index, raw)?),
    })
}

/// Decode every field that can be decoded and collect the failures of the rest
pub fn decode_lenient(index: usize, raw: &RawChunk) -> (MetadataChunk, Vec<MalformedMetadata>) {
    let mut errors = Vec::new();
    let chunk = MetadataChunk {
        frame_id: keep(frame_id(index, raw), &mut errors),
        exposure_us: keep(number(index, raw, EXPOSURE_TIME), &mut errors),
        gain_db: keep(number(index, raw, GAIN), &mut errors),
        black_level: keep(number(index, raw, BLACK_LEVEL), &mut errors),
        pixel_format: keep(pixel_format(index, raw), &mut errors),
    };
    (chunk, errors)
}

fn keep<T>(result: Result<T, MalformedMetadata>, errors: &mut Vec<MalformedMetadata>) -> Option<T> {
    result.map_err(|err| errors.push(err)).ok()
}

fn field<'a>(
    index: usize,
    raw: &'a RawChunk,
    name: &str,
) -> Result<&'a ChunkValue, MalformedMetadata> {
    raw.get(name).ok_or_else(|| malformed(index, name, "is missing"))
}

fn frame_id(index: usize, raw: &RawChunk) -> Result<u64, MalformedMetadata> {
    match field(index, raw, FRAME_ID)? {
        ChunkValue::Integer(id) => {
            u64::try_from(*id).map_err(|_| malformed(index, FRAME_ID, "is negative"))
        }
        other => Err(malformed(index, FRAME_ID, &format!("is not an integer: {other:?}"))),
    }
}

fn number(index: usize, raw: &RawChunk, name: &str) -> Result<f64, MalformedMetadata> {
    let value = match field(index, raw, name)? {
        ChunkValue::Float(value) => *value,
        ChunkValue::Integer(value) => *value as f64,
        other => return Err(malformed(index, name, &format!("is not numeric: {other:?}"))),
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(malformed(index, name, "is not finite"))
    }
}

fn pixel_format(index: usize, raw: &RawChunk) -> Result<PixelFormat, MalformedMetadata> {
    match field(index, raw, PIXEL_FORMAT)? {
        ChunkValue::Text(name) => name
            .parse()
            .map_err(|err: String| malformed(index, PIXEL_FORMAT, &err)),
        other => Err(malformed(index, PIXEL_FORMAT, &format!("is not text: {other:?}"))),
    }
}

fn malformed(index: usize, field: &str, reason: &str) -> MalformedMetadata {
    MalformedMetadata {
        index,
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}
