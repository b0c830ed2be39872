//! Lossless multi-page TIFF exporter.
//!
//! One LZW-compressed page per frame. Every page carries its own full set of format tags,
//! so each is readable on its own: RGB buffers are written as chunky RGB pages, Mono and
//! Bayer buffers as single-sample BlackIsZero pages holding the raw sensor values.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use tiff::encoder::colortype::{ColorType, Gray16, Gray8, RGB16, RGB8};
use tiff::encoder::compression::Lzw;
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tracing::{debug, instrument};

use super::Burst;
use crate::capture::frame::{Frame, PixelFormat};
use crate::error::ExportError;

const SOFTWARE: &str = concat!("strobe ", env!("CARGO_PKG_VERSION"));
const PLANAR_CHUNKY: u16 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageStackExporter;

impl ImageStackExporter {
    pub fn check(&self, format: PixelFormat) -> Result<(), ExportError> {
        if !matches!(format.bit_depth(), 8 | 16) {
            return Err(ExportError::UnsupportedBitDepth {
                exporter: "image-stack",
                bits: format.bit_depth(),
            });
        }
        match format.channels() {
            1 | 3 => Ok(()),
            channels => Err(ExportError::UnsupportedChannels {
                exporter: "image-stack",
                channels,
            }),
        }
    }

    #[instrument(skip_all, fields(frames = burst.frames.len()))]
    pub fn write(&self, burst: &Burst, path: &Path) -> Result<(), ExportError> {
        let file = File::create(path).map_err(|source| ExportError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file))?;

        let total = burst.frames.len();
        for (index, frame) in burst.frames.iter().enumerate() {
            let desc = format!(
                "frame {}/{} t={:.6}s id={}",
                index + 1,
                total,
                frame.timestamp,
                frame.meta.frame_id.map_or_else(|| "?".to_owned(), |id| id.to_string())
            );
            let image = &frame.image;
            match frame.format() {
                PixelFormat::Rgb8 => {
                    write_page::<RGB8, _>(&mut encoder, frame, image.samples_u8(), &desc)?
                }
                PixelFormat::Rgb16 => {
                    write_page::<RGB16, _>(&mut encoder, frame, &image.samples_u16(), &desc)?
                }
                PixelFormat::Mono8 | PixelFormat::BayerRg8 => {
                    write_page::<Gray8, _>(&mut encoder, frame, image.samples_u8(), &desc)?
                }
                PixelFormat::Mono16 | PixelFormat::BayerRg16 => {
                    write_page::<Gray16, _>(&mut encoder, frame, &image.samples_u16(), &desc)?
                }
            }
        }
        debug!("wrote {total} pages");
        Ok(())
    }
}

fn write_page<C, W>(
    encoder: &mut TiffEncoder<W>,
    frame: &Frame,
    samples: &[C::Inner],
    description: &str,
) -> Result<(), ExportError>
where
    C: ColorType,
    W: Write + Seek,
    [C::Inner]: TiffValue,
{
    let mut page =
        encoder.new_image_with_compression::<C, _>(frame.width(), frame.height(), Lzw)?;
    page.encoder().write_tag(Tag::PlanarConfiguration, PLANAR_CHUNKY)?;
    page.encoder().write_tag(Tag::Software, SOFTWARE)?;
    page.encoder().write_tag(Tag::ImageDescription, description)?;
    page.write_data(samples)?;
    Ok(())
}
