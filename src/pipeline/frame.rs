use std::sync::Arc;

use crate::tracker::Rect;

/// One decoded video frame, RGB8, row-major. The pixel buffer is shared so
/// workers can hold the frame without copying it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    /// Capture time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

/// Frame header without pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub index: u64,
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
}

/// Pixels of one box cut out of a frame, RGB8.
#[derive(Debug, Clone, PartialEq)]
pub struct Crop {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(
        index: u64,
        timestamp_ms: u64,
        width: u32,
        height: u32,
        data: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            index,
            timestamp_ms,
            width,
            height,
            data: data.into(),
        }
    }

    /// Black frame of the given size.
    pub fn blank(index: u64, timestamp_ms: u64, width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * 3;
        Self::new(index, timestamp_ms, width, height, vec![0u8; len])
    }

    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            index: self.index,
            timestamp_ms: self.timestamp_ms,
            width: self.width,
            height: self.height,
        }
    }

    /// Copy the pixels under `rect`, clipped to the frame. `None` when the
    /// box is outside the frame or the buffer is shorter than advertised.
    pub fn crop(&self, rect: &Rect) -> Option<Crop> {
        let stride = self.width as usize * 3;
        if self.data.len() < stride * self.height as usize {
            return None;
        }
        let (x, y, w, h) = rect.pixel_window(self.width, self.height)?;
        let (x, y, w, h) = (x as usize, y as usize, w as usize, h as usize);

        let mut data = Vec::with_capacity(w * h * 3);
        for row in y..y + h {
            let start = row * stride + x * 3;
            data.extend_from_slice(&self.data[start..start + w * 3]);
        }
        Some(Crop {
            width: w as u32,
            height: h as u32,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_clips_to_frame() {
        let pixels: Vec<u8> = (0..4 * 3 * 3).map(|v| v as u8).collect();
        let frame = Frame::new(0, 0, 4, 3, pixels);
        let crop = frame.crop(&Rect::new(2.0, 1.0, 10.0, 10.0)).unwrap();
        assert_eq!((crop.width, crop.height), (2, 2));
        // Row 1, columns 2..4
        assert_eq!(&crop.data[..6], &[18, 19, 20, 21, 22, 23]);
    }

    #[test]
    fn test_crop_outside_or_short_buffer() {
        let frame = Frame::blank(0, 0, 4, 4);
        assert!(frame.crop(&Rect::new(10.0, 10.0, 5.0, 5.0)).is_none());
        let short = Frame::new(0, 0, 4, 4, vec![0u8; 5]);
        assert!(short.crop(&Rect::new(0.0, 0.0, 2.0, 2.0)).is_none());
    }
}
