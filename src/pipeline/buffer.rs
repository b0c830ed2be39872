//! Fixed-capacity, append-only store for one burst

use crate::capture::frame::Frame;
use crate::error::BufferError;

/// Holds exactly `capacity` frames in arrival order until handed to one consumer
#[derive(Debug)]
pub struct FrameBuffer {
    frames: Vec<Frame>,
    capacity: usize,
    consumed: bool,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
            consumed: false,
        }
    }

    /// Append in arrival order; every frame must share the first frame's geometry and format
    pub fn append(&mut self, frame: Frame) -> Result<(), BufferError> {
        if self.consumed {
            return Err(BufferError::AlreadyConsumed);
        }
        if self.frames.len() >= self.capacity {
            return Err(BufferError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if let Some(first) = self.frames.first() {
            let expected = (first.width(), first.height(), first.format());
            let found = (frame.width(), frame.height(), frame.format());
            if expected != found {
                return Err(BufferError::MixedFormat {
                    index: self.frames.len(),
                    expected,
                    found,
                });
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_complete(&self) -> bool {
        !self.consumed && self.frames.len() == self.capacity
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Hand the frames over; the buffer is exhausted afterwards
    pub fn consume(&mut self) -> Result<Vec<Frame>, BufferError> {
        if self.consumed {
            return Err(BufferError::AlreadyConsumed);
        }
        self.consumed = true;
        Ok(std::mem::take(&mut self.frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{Image, PixelFormat};
    use crate::capture::metadata::MetadataChunk;

    fn frame(index: usize) -> Frame {
        Frame {
            image: Image::new(2, 2, PixelFormat::Mono8, vec![index as u8; 4]),
            timestamp: index as f64 * 0.005,
            meta: MetadataChunk {
                frame_id: Some(index as u64),
                ..MetadataChunk::default()
            },
        }
    }

    #[test]
    fn test_incomplete_until_last_frame() {
        let mut buffer = FrameBuffer::with_capacity(5);
        for index in 0..5 {
            assert!(!buffer.is_complete(), "complete at {index}");
            buffer.append(frame(index)).expect("within capacity");
        }
        assert!(buffer.is_complete());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_append_past_capacity_fails() {
        let mut buffer = FrameBuffer::with_capacity(2);
        buffer.append(frame(0)).expect("first");
        buffer.append(frame(1)).expect("second");
        assert_eq!(
            buffer.append(frame(2)),
            Err(BufferError::CapacityExceeded { capacity: 2 })
        );
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_preserves_arrival_order() {
        let mut buffer = FrameBuffer::with_capacity(4);
        for index in 0..4 {
            buffer.append(frame(index)).expect("append");
        }
        let ids: Vec<_> = buffer
            .consume()
            .expect("consume")
            .iter()
            .map(|frame| frame.meta.frame_id)
            .collect();
        assert_eq!(ids, vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_second_consume_fails_regardless_of_fill() {
        for fill in [0, 1, 3] {
            let mut buffer = FrameBuffer::with_capacity(3);
            for index in 0..fill {
                buffer.append(frame(index)).expect("append");
            }
            assert_eq!(buffer.consume().expect("first consume").len(), fill);
            assert!(matches!(buffer.consume(), Err(BufferError::AlreadyConsumed)));
            assert!(!buffer.is_complete());
            assert_eq!(buffer.append(frame(0)), Err(BufferError::AlreadyConsumed));
        }
    }

    #[test]
    fn test_rejects_mixed_geometry() {
        let mut buffer = FrameBuffer::with_capacity(2);
        buffer.append(frame(0)).expect("first");
        let mut odd = frame(1);
        odd.image = Image::new(4, 1, PixelFormat::Mono8, vec![0; 4]);
        assert!(matches!(buffer.append(odd), Err(BufferError::MixedFormat { index: 1, .. })));
    }
}
