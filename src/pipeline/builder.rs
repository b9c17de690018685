//! Conversion of raw detector output into tracker [`Detection`]s.

use crate::reid::Embedding;
use crate::tracker::{Detection, Rect};

/// Builds a [`Detection`] from whichever box layout a backend produces,
/// optionally clipped to the frame it was detected on.
///
/// ```ignore
/// let det = DetectionBuilder::new()
///     .xywh(cx, cy, w, h)
///     .clip_to(frame.width, frame.height)
///     .score(conf)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct DetectionBuilder {
    bbox: Rect,
    bounds: Option<(f32, f32)>,
    score: f32,
    embedding: Option<Embedding>,
}

impl DetectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Corners `(x1, y1, x2, y2)`.
    pub fn tlbr(mut self, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        self.bbox = Rect::from_tlbr(x1, y1, x2, y2);
        self
    }

    /// Center plus size, as YOLO-style heads emit.
    pub fn xywh(mut self, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::new(cx - w / 2.0, cy - h / 2.0, w, h);
        self
    }

    /// Top-left corner plus size.
    pub fn tlwh(mut self, x: f32, y: f32, w: f32, h: f32) -> Self {
        self.bbox = Rect::new(x, y, w, h);
        self
    }

    /// Corners as fractions of the frame size.
    pub fn normalized(self, x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        self.tlbr(x1 * w, y1 * h, x2 * w, y2 * h)
    }

    /// Clip the box to `[0, width] x [0, height]` when built.
    pub fn clip_to(mut self, width: u32, height: u32) -> Self {
        self.bounds = Some((width as f32, height as f32));
        self
    }

    pub fn score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    /// Appearance embedding computed by the detector, if it produces one.
    pub fn embedding(mut self, embedding: impl Into<Embedding>) -> Self {
        self.embedding = Some(embedding.into());
        self
    }

    pub fn build(self) -> Detection {
        let mut bbox = self.bbox;
        if let Some((width, height)) = self.bounds {
            let [x1, y1, x2, y2] = bbox.to_tlbr();
            bbox = Rect::from_tlbr(
                x1.clamp(0.0, width),
                y1.clamp(0.0, height),
                x2.clamp(0.0, width),
                y2.clamp(0.0, height),
            );
        }
        let detection = Detection::from_rect(bbox, self.score);
        match self.embedding {
            Some(embedding) => detection.with_embedding(embedding),
            None => detection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_formats_agree() {
        let a = DetectionBuilder::new().tlbr(10.0, 20.0, 50.0, 80.0).score(0.95).build();
        let b = DetectionBuilder::new().tlwh(10.0, 20.0, 40.0, 60.0).build();
        let c = DetectionBuilder::new().xywh(30.0, 50.0, 40.0, 60.0).build();
        let d = DetectionBuilder::new().normalized(0.1, 0.2, 0.5, 0.8, 100, 100).build();

        assert_eq!(a.score, 0.95);
        assert_eq!(a.bbox, b.bbox);
        assert_eq!(a.bbox, c.bbox);
        assert!((a.bbox.width - d.bbox.width).abs() < 1e-4);
        assert!((a.bbox.y - d.bbox.y).abs() < 1e-4);
        assert!(a.embedding.is_none());
    }

    #[test]
    fn test_clip_keeps_box_inside_frame() {
        let det = DetectionBuilder::new()
            .tlwh(620.0, -10.0, 50.0, 200.0)
            .clip_to(640, 480)
            .build();
        assert_eq!(det.bbox.to_tlbr(), [620.0, 0.0, 640.0, 190.0]);
    }

    #[test]
    fn test_embedding_is_attached() {
        let det = DetectionBuilder::new()
            .tlbr(0.0, 0.0, 10.0, 10.0)
            .embedding(vec![3.0, 4.0])
            .build();
        let embedding = det.embedding.unwrap();
        assert_eq!(embedding.dim(), 2);
    }
}
