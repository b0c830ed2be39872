//! Minimal Motion-JPEG AVI (RIFF) container.
//!
//! One video stream, one `00dc` chunk per JPEG frame, followed by an `idx1` index. Header
//! fields that depend on the frame count are patched in by [`AviWriter::finish`].

use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const CHUNK_ID: &[u8; 4] = b"00dc";

struct IndexEntry {
    offset: u32,
    size: u32,
}

/// Streams JPEG frames into an AVI file
pub struct AviWriter<W: Write + Seek> {
    inner: W,
    index: Vec<IndexEntry>,
    max_chunk: u32,
    riff_size_at: u64,
    total_frames_at: u64,
    avih_buffer_at: u64,
    stream_length_at: u64,
    strh_buffer_at: u64,
    movi_size_at: u64,
    movi_start: u64,
}

impl<W: Write + Seek> AviWriter<W> {
    /// Write the headers; frame-count dependent fields are placeholders until `finish`
    pub fn new(mut inner: W, width: u32, height: u32, fps: u32) -> io::Result<Self> {
        inner.write_all(b"RIFF")?;
        let riff_size_at = inner.stream_position()?;
        inner.write_u32::<LittleEndian>(0)?;
        inner.write_all(b"AVI ")?;

        // hdrl = 'hdrl' + avih chunk (8 + 56) + strl list (8 + 4 + (8 + 56) + (8 + 40))
        inner.write_all(b"LIST")?;
        inner.write_u32::<LittleEndian>(4 + 64 + 124)?;
        inner.write_all(b"hdrl")?;

        inner.write_all(b"avih")?;
        inner.write_u32::<LittleEndian>(56)?;
        inner.write_u32::<LittleEndian>(1_000_000 / fps.max(1))?;
        inner.write_u32::<LittleEndian>(0)?; // max bytes per second
        inner.write_u32::<LittleEndian>(0)?; // padding granularity
        inner.write_u32::<LittleEndian>(AVIF_HASINDEX)?;
        let total_frames_at = inner.stream_position()?;
        inner.write_u32::<LittleEndian>(0)?;
        inner.write_u32::<LittleEndian>(0)?; // initial frames
        inner.write_u32::<LittleEndian>(1)?; // streams
        let avih_buffer_at = inner.stream_position()?;
        inner.write_u32::<LittleEndian>(0)?;
        inner.write_u32::<LittleEndian>(width)?;
        inner.write_u32::<LittleEndian>(height)?;
        for _ in 0..4 {
            inner.write_u32::<LittleEndian>(0)?;
        }

        inner.write_all(b"LIST")?;
        inner.write_u32::<LittleEndian>(4 + 64 + 48)?;
        inner.write_all(b"strl")?;

        inner.write_all(b"strh")?;
        inner.write_u32::<LittleEndian>(56)?;
        inner.write_all(b"vids")?;
        inner.write_all(b"MJPG")?;
        inner.write_u32::<LittleEndian>(0)?; // flags
        inner.write_u16::<LittleEndian>(0)?; // priority
        inner.write_u16::<LittleEndian>(0)?; // language
        inner.write_u32::<LittleEndian>(0)?; // initial frames
        inner.write_u32::<LittleEndian>(1)?; // scale
        inner.write_u32::<LittleEndian>(fps)?; // rate
        inner.write_u32::<LittleEndian>(0)?; // start
        let stream_length_at = inner.stream_position()?;
        inner.write_u32::<LittleEndian>(0)?;
        let strh_buffer_at = inner.stream_position()?;
        inner.write_u32::<LittleEndian>(0)?;
        inner.write_u32::<LittleEndian>(u32::MAX)?; // default quality
        inner.write_u32::<LittleEndian>(0)?; // sample size
        inner.write_i16::<LittleEndian>(0)?;
        inner.write_i16::<LittleEndian>(0)?;
        inner.write_i16::<LittleEndian>(clamp_i16(width))?;
        inner.write_i16::<LittleEndian>(clamp_i16(height))?;

        // BITMAPINFOHEADER
        inner.write_all(b"strf")?;
        inner.write_u32::<LittleEndian>(40)?;
        inner.write_u32::<LittleEndian>(40)?;
        inner.write_i32::<LittleEndian>(width as i32)?;
        inner.write_i32::<LittleEndian>(height as i32)?;
        inner.write_u16::<LittleEndian>(1)?; // planes
        inner.write_u16::<LittleEndian>(24)?; // bit count
        inner.write_all(b"MJPG")?;
        inner.write_u32::<LittleEndian>(width.saturating_mul(height).saturating_mul(3))?;
        for _ in 0..4 {
            inner.write_u32::<LittleEndian>(0)?;
        }

        inner.write_all(b"LIST")?;
        let movi_size_at = inner.stream_position()?;
        inner.write_u32::<LittleEndian>(0)?;
        let movi_start = inner.stream_position()?;
        inner.write_all(b"movi")?;

        Ok(Self {
            inner,
            index: Vec::new(),
            max_chunk: 0,
            riff_size_at,
            total_frames_at,
            avih_buffer_at,
            stream_length_at,
            strh_buffer_at,
            movi_size_at,
            movi_start,
        })
    }

    /// Append one encoded JPEG as a keyframe
    pub fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()> {
        let size = u32::try_from(jpeg.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame larger than 4 GiB"))?;
        let position = self.inner.stream_position()?;
        let offset = to_u32(position - self.movi_start)?;

        self.inner.write_all(CHUNK_ID)?;
        self.inner.write_u32::<LittleEndian>(size)?;
        self.inner.write_all(jpeg)?;
        if size % 2 == 1 {
            self.inner.write_u8(0)?;
        }

        self.index.push(IndexEntry { offset, size });
        self.max_chunk = self.max_chunk.max(size);
        Ok(())
    }

    /// Write the index, patch sizes and counts, and hand back the writer
    pub fn finish(mut self) -> io::Result<W> {
        let movi_end = self.inner.stream_position()?;

        self.inner.write_all(b"idx1")?;
        self.inner.write_u32::<LittleEndian>(to_u32(self.index.len() * 16)?)?;
        for entry in &self.index {
            self.inner.write_all(CHUNK_ID)?;
            self.inner.write_u32::<LittleEndian>(AVIIF_KEYFRAME)?;
            self.inner.write_u32::<LittleEndian>(entry.offset)?;
            self.inner.write_u32::<LittleEndian>(entry.size)?;
        }
        let end = self.inner.stream_position()?;

        let frames = to_u32(self.index.len())?;
        let suggested = self.max_chunk + 8;
        self.patch(self.riff_size_at, to_u32(end - 8)?)?;
        self.patch(self.total_frames_at, frames)?;
        self.patch(self.avih_buffer_at, suggested)?;
        self.patch(self.stream_length_at, frames)?;
        self.patch(self.strh_buffer_at, suggested)?;
        self.patch(self.movi_size_at, to_u32(movi_end - self.movi_start)?)?;

        self.inner.seek(SeekFrom::Start(end))?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn patch(&mut self, at: u64, value: u32) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(at))?;
        self.inner.write_u32::<LittleEndian>(value)
    }
}

fn clamp_i16(value: u32) -> i16 {
    i16::try_from(value).unwrap_or(i16::MAX)
}

fn to_u32<T: TryInto<u32>>(value: T) -> io::Result<u32> {
    value
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "AVI exceeds 4 GiB"))
}

/// What a Motion-JPEG AVI says about itself
#[derive(Debug, Clone)]
pub struct AviSummary {
    pub width: u32,
    pub height: u32,
    /// Playback rate, `rate / scale` from the stream header
    pub fps: f64,
    /// Frame count declared in the main header
    pub declared_frames: u32,
    /// JPEG payloads found in the `movi` list, in order
    pub frames: Vec<Vec<u8>>,
}

/// Parse an AVI written by [`AviWriter`] (or any single-stream MJPEG AVI)
pub fn read_mjpeg_avi(path: &Path) -> io::Result<AviSummary> {
    let data = fs::read(path)?;
    let mut cursor = Cursor::new(data.as_slice());

    if read_fourcc(&mut cursor)? != *b"RIFF" {
        return Err(invalid("not a RIFF file"));
    }
    let riff_end = (cursor.read_u32::<LittleEndian>()? as u64 + 8).min(data.len() as u64);
    if read_fourcc(&mut cursor)? != *b"AVI " {
        return Err(invalid("not an AVI file"));
    }

    let mut summary = AviSummary {
        width: 0,
        height: 0,
        fps: 0.0,
        declared_frames: 0,
        frames: Vec::new(),
    };
    walk(&mut cursor, riff_end, &mut summary)?;
    Ok(summary)
}

fn walk(cursor: &mut Cursor<&[u8]>, end: u64, summary: &mut AviSummary) -> io::Result<()> {
    while cursor.position() + 8 <= end {
        let id = read_fourcc(cursor)?;
        let size = cursor.read_u32::<LittleEndian>()? as u64;
        let body = cursor.position();
        let next = body + size + (size & 1);
        if body + size > end {
            return Err(invalid("chunk runs past end of file"));
        }

        match &id {
            b"LIST" => {
                // hdrl, strl and movi are all walked the same way
                let _kind = read_fourcc(cursor)?;
                walk(cursor, body + size, summary)?;
            }
            b"avih" => {
                cursor.seek(SeekFrom::Current(16))?;
                summary.declared_frames = cursor.read_u32::<LittleEndian>()?;
                cursor.seek(SeekFrom::Current(12))?;
                summary.width = cursor.read_u32::<LittleEndian>()?;
                summary.height = cursor.read_u32::<LittleEndian>()?;
            }
            b"strh" => {
                cursor.seek(SeekFrom::Current(20))?;
                let scale = cursor.read_u32::<LittleEndian>()?;
                let rate = cursor.read_u32::<LittleEndian>()?;
                if scale > 0 {
                    summary.fps = rate as f64 / scale as f64;
                }
            }
            id if id[2..] == *b"dc" => {
                let mut frame = vec![0; size as usize];
                cursor.read_exact(&mut frame)?;
                summary.frames.push(frame);
            }
            _ => {}
        }
        cursor.set_position(next);
    }
    Ok(())
}

fn read_fourcc(cursor: &mut Cursor<&[u8]>) -> io::Result<[u8; 4]> {
    let mut fourcc = [0; 4];
    cursor.read_exact(&mut fourcc)?;
    Ok(fourcc)
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(frames: &[&[u8]], fps: u32) -> Vec<u8> {
        let mut writer = AviWriter::new(Cursor::new(Vec::new()), 4, 2, fps).expect("headers");
        for frame in frames {
            writer.write_frame(frame).expect("frame");
        }
        writer.finish().expect("finish").into_inner()
    }

    #[test]
    fn test_header_layout() {
        let bytes = write(&[b"abcd", b"xyz"], 20);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        let riff_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(riff_size + 8, bytes.len());

        // movi list starts right after the fixed-size header block
        assert_eq!(&bytes[212..216], b"LIST");
        assert_eq!(&bytes[220..224], b"movi");
        assert_eq!(&bytes[224..228], b"00dc");
    }

    #[test]
    fn test_index_offsets_point_at_chunks() {
        let bytes = write(&[b"abc", b"defgh"], 20);
        let idx = bytes
            .windows(4)
            .rposition(|window| window == b"idx1")
            .expect("index present");
        let entry = |n: usize| {
            let at = idx + 8 + n * 16;
            let field = |k: usize| {
                u32::from_le_bytes(bytes[at + k..at + k + 4].try_into().expect("four bytes"))
            };
            (field(8) as usize, field(12) as usize)
        };

        // offsets are relative to the 'movi' fourcc at byte 220; odd chunks are padded
        assert_eq!(entry(0), (4, 3));
        assert_eq!(entry(1), (4 + 8 + 4, 5));
        assert_eq!(&bytes[220 + 16..220 + 20], b"00dc");
    }

    #[test]
    fn test_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.avi");
        fs::write(&path, write(&[b"one", b"three", b"x"], 25)).expect("write file");

        let summary = read_mjpeg_avi(&path).expect("parse");
        assert_eq!((summary.width, summary.height), (4, 2));
        assert_eq!(summary.fps, 25.0);
        assert_eq!(summary.declared_frames, 3);
        assert_eq!(summary.frames, vec![b"one".to_vec(), b"three".to_vec(), b"x".to_vec()]);
    }

    #[test]
    fn test_rejects_non_avi() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.avi");
        fs::write(&path, b"RIFF\x04\x00\x00\x00WAVE").expect("write file");
        assert!(read_mjpeg_avi(&path).is_err());
    }
}
