use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::metadata::MetadataChunk;

/// Sensor pixel formats we pass through untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Mono16,
    #[serde(rename = "BayerRG8")]
    BayerRg8,
    #[serde(rename = "BayerRG16")]
    BayerRg16,
    #[serde(rename = "RGB8")]
    Rgb8,
    #[serde(rename = "RGB16")]
    Rgb16,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Mono8,
        PixelFormat::Mono16,
        PixelFormat::BayerRg8,
        PixelFormat::BayerRg16,
        PixelFormat::Rgb8,
        PixelFormat::Rgb16,
    ];

    /// Bits per channel sample
    pub fn bit_depth(self) -> u8 {
        match self {
            Self::Mono8 | Self::BayerRg8 | Self::Rgb8 => 8,
            Self::Mono16 | Self::BayerRg16 | Self::Rgb16 => 16,
        }
    }

    pub fn channels(self) -> u8 {
        match self {
            Self::Rgb8 | Self::Rgb16 => 3,
            _ => 1,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        usize::from(self.channels()) * usize::from(self.bit_depth() / 8)
    }

    /// GenICam PFNC name, as carried in chunk data
    pub fn name(self) -> &'static str {
        match self {
            Self::Mono8 => "Mono8",
            Self::Mono16 => "Mono16",
            Self::BayerRg8 => "BayerRG8",
            Self::BayerRg16 => "BayerRG16",
            Self::Rgb8 => "RGB8",
            Self::Rgb16 => "RGB16",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown pixel format '{s}'"))
    }
}

/// Raw image payload as delivered by the driver.
///
/// Samples are row-major and chunky (RGBRGB...); 16-bit samples are little endian.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl Image {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            format,
            data: data.into(),
        }
    }

    /// Payload size implied by the dimensions and format
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn samples_u8(&self) -> &[u8] {
        &self.data
    }

    /// Unpack 16-bit little endian samples
    pub fn samples_u16(&self) -> Vec<u16> {
        let mut samples = vec![0u16; self.data.len() / 2];
        LittleEndian::read_u16_into(&self.data[..samples.len() * 2], &mut samples);
        samples
    }
}

/// One buffered sample of a burst
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Image,

    /// Arrival time on the driver's monotonic clock, seconds
    pub timestamp: f64,

    pub meta: MetadataChunk,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn format(&self) -> PixelFormat {
        self.image.format
    }
}

/// Live-view sample, displayed and discarded
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub image: Image,
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_geometry() {
        assert_eq!(PixelFormat::Rgb8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Rgb16.bytes_per_pixel(), 6);
        assert_eq!(PixelFormat::BayerRg16.bytes_per_pixel(), 2);
        assert_eq!(PixelFormat::Mono8.channels(), 1);
        assert_eq!(PixelFormat::Rgb16.bit_depth(), 16);
    }

    #[test]
    fn test_pixel_format_names_round_trip() {
        for format in PixelFormat::ALL {
            let parsed: PixelFormat = format.name().parse().expect("known name");
            assert_eq!(parsed, format);
        }
        assert!("YUV422".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_samples_u16_little_endian() {
        let image = Image::new(2, 1, PixelFormat::Mono16, vec![0x34, 0x12, 0xff, 0x00]);
        assert_eq!(image.samples_u16(), vec![0x1234, 0x00ff]);
        assert_eq!(image.expected_len(), 4);
    }
}
