//! Association utilities: detection type, optimal and greedy assignment.

use ndarray::Array2;

use crate::reid::Embedding;
use crate::tracker::rect::Rect;

/// Detection input for the tracker.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: Rect,
    /// Detection confidence score
    pub score: f32,
    /// Appearance embedding, when the detector (or a Re-ID stage) provides one.
    pub embedding: Option<Embedding>,
}

impl Detection {
    /// Detection from corner coordinates `(x1, y1, x2, y2)`.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            bbox: Rect::from_tlbr(x1, y1, x2, y2),
            score,
            embedding: None,
        }
    }

    pub fn from_rect(bbox: Rect, score: f32) -> Self {
        Self {
            bbox,
            score,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Optimal one-to-one assignment over an IoU similarity matrix
/// (rows = tracks, columns = detections).
///
/// Pairs whose IoU does not exceed `min_iou` are rejected even if the solver
/// selected them.
pub fn linear_assignment(ious: &Array2<f32>, min_iou: f32) -> AssignmentResult {
    let (num_rows, num_cols) = ious.dim();

    if num_rows == 0 || num_cols == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_tracks: (0..num_rows).collect(),
            unmatched_detections: (0..num_cols).collect(),
        };
    }

    // lapjv needs a square matrix; pad with a prohibitive cost.
    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), 1e6);
    for ((i, j), &iou) in ious.indexed_iter() {
        padded[[i, j]] = 1.0 - iou as f64;
    }

    let mut matches = vec![];
    let mut unmatched_tracks = vec![];
    let mut detection_free = vec![true; num_cols];

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => {
            for (row, &col) in row_to_col.iter().enumerate().take(num_rows) {
                if col < num_cols && ious[[row, col]] > min_iou {
                    matches.push((row, col));
                    detection_free[col] = false;
                } else {
                    unmatched_tracks.push(row);
                }
            }
        }
        Err(_) => {
            tracing::warn!(rows = num_rows, cols = num_cols, "lapjv failed; skipping primary association");
            unmatched_tracks = (0..num_rows).collect();
        }
    }

    let unmatched_detections = detection_free
        .iter()
        .enumerate()
        .filter_map(|(j, &free)| free.then_some(j))
        .collect();

    AssignmentResult {
        matches,
        unmatched_tracks,
        unmatched_detections,
    }
}

/// Second pass for pairs the optimal solver left apart: each leftover
/// detection (in index order) takes the leftover track with the highest IoU,
/// provided that IoU still exceeds `min_iou`.
///
/// Matched indices are removed from `result`'s unmatched lists and appended
/// to its matches.
pub fn greedy_fallback(ious: &Array2<f32>, result: &mut AssignmentResult, min_iou: f32) {
    let mut extra = Vec::new();
    let mut still_unmatched = Vec::new();

    for &det in &result.unmatched_detections {
        let best = result
            .unmatched_tracks
            .iter()
            .map(|&trk| (trk, ious[[trk, det]]))
            .filter(|&(_, iou)| iou > min_iou)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));

        match best {
            Some((trk, _)) => {
                result.unmatched_tracks.retain(|&t| t != trk);
                extra.push((trk, det));
            }
            None => still_unmatched.push(det),
        }
    }

    result.unmatched_detections = still_unmatched;
    result.matches.extend(extra);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_linear_assignment_respects_threshold() {
        let ious = array![[0.9_f32, 0.0], [0.0, 0.2]];
        let result = linear_assignment(&ious, 0.3);
        assert_eq!(result.matches, vec![(0, 0)]);
        assert_eq!(result.unmatched_tracks, vec![1]);
        assert_eq!(result.unmatched_detections, vec![1]);
    }

    #[test]
    fn test_linear_assignment_empty() {
        let ious = Array2::<f32>::zeros((0, 3));
        let result = linear_assignment(&ious, 0.3);
        assert!(result.matches.is_empty());
        assert_eq!(result.unmatched_detections, vec![0, 1, 2]);
    }

    #[test]
    fn test_greedy_fallback_rejects_below_threshold() {
        let ious = array![[0.25_f32]];
        let mut result = AssignmentResult {
            matches: vec![],
            unmatched_tracks: vec![0],
            unmatched_detections: vec![0],
        };
        greedy_fallback(&ious, &mut result, 0.3);
        assert!(result.matches.is_empty());
        assert_eq!(result.unmatched_tracks, vec![0]);
        assert_eq!(result.unmatched_detections, vec![0]);
    }

    #[test]
    fn test_greedy_fallback_picks_highest_iou() {
        let ious = array![[0.4_f32], [0.6]];
        let mut result = AssignmentResult {
            matches: vec![],
            unmatched_tracks: vec![0, 1],
            unmatched_detections: vec![0],
        };
        greedy_fallback(&ious, &mut result, 0.3);
        assert_eq!(result.matches, vec![(1, 0)]);
        assert_eq!(result.unmatched_tracks, vec![0]);
        assert!(result.unmatched_detections.is_empty());
    }
}
