//! Single tracked identity.

use crate::TrackId;
use crate::tracker::matching::Detection;
use crate::tracker::rect::Rect;
use crate::tracker::track_state::TrackState;

/// A persistent identity for one physical person.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    /// Latest raw detection box
    pub bbox: Rect,
    /// EMA-smoothed box; used for association and reference points
    pub smoothed_bbox: Rect,
    /// Confidence of the latest matched detection
    pub score: f32,
    /// Frames since creation
    pub age: u32,
    /// Consecutive matched frames
    pub hits: u32,
    pub time_since_update: u32,
    pub state: TrackState,
    /// Bottom-centre of the smoothed box at the last match
    pub last_position: (f32, f32),
    /// Tracker frame of the last match
    pub last_seen_frame: u64,
}

impl Track {
    pub(crate) fn new(id: TrackId, detection: &Detection, frame: u64) -> Self {
        Self {
            id,
            bbox: detection.bbox,
            smoothed_bbox: detection.bbox,
            score: detection.score,
            age: 0,
            hits: 1,
            time_since_update: 0,
            state: TrackState::Tentative,
            last_position: detection.bbox.bottom_center(),
            last_seen_frame: frame,
        }
    }

    /// A track that continues a disappeared identity. It skips the tentative
    /// phase because the identity was already confirmed before the gap.
    pub(crate) fn inherited(id: TrackId, detection: &Detection, frame: u64, min_hits: u32) -> Self {
        Self {
            hits: min_hits.max(1),
            state: TrackState::Confirmed,
            ..Self::new(id, detection, frame)
        }
    }

    /// Constant-position prediction: the box stays put, only counters advance.
    pub(crate) fn predict(&mut self) {
        self.age += 1;
        self.time_since_update += 1;
    }

    /// Absorb a matched detection.
    pub(crate) fn update(&mut self, detection: &Detection, frame: u64, alpha: f32, min_hits: u32) {
        self.bbox = detection.bbox;
        self.smoothed_bbox = self.smoothed_bbox.blend(&detection.bbox, alpha);
        self.score = detection.score;
        self.time_since_update = 0;
        self.hits += 1;
        self.last_position = self.smoothed_bbox.bottom_center();
        self.last_seen_frame = frame;

        match self.state {
            TrackState::Tentative if self.hits >= min_hits => self.state = TrackState::Confirmed,
            TrackState::Stale => self.state = TrackState::Confirmed,
            _ => {}
        }
    }

    /// Bookkeeping for a frame without a match.
    pub(crate) fn mark_missed(&mut self, visibility_cutoff: u32, max_age: u32) {
        match self.state {
            TrackState::Tentative => {
                self.hits = 0;
                if self.time_since_update > visibility_cutoff {
                    self.state = TrackState::Deleted;
                }
            }
            TrackState::Confirmed | TrackState::Stale => {
                if self.time_since_update > max_age {
                    self.state = TrackState::Deleted;
                } else if self.time_since_update > visibility_cutoff {
                    self.state = TrackState::Stale;
                }
            }
            TrackState::Deleted => {}
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32) -> Detection {
        Detection::new(x, 0.0, x + 10.0, 20.0, 0.9)
    }

    #[test]
    fn test_smoothing_applies_from_first_hit() {
        let mut track = Track::new(1, &det(0.0), 1);
        track.predict();
        track.update(&det(10.0), 2, 0.5, 3);
        assert_eq!(track.bbox.x, 10.0);
        assert_eq!(track.smoothed_bbox.x, 5.0);
        assert_eq!(track.last_position, (10.0, 20.0));
    }

    #[test]
    fn test_confirmation_and_staleness() {
        let mut track = Track::new(1, &det(0.0), 1);
        for frame in 2..=3 {
            track.predict();
            track.update(&det(0.0), frame, 0.5, 3);
        }
        assert_eq!(track.state, TrackState::Confirmed);

        for _ in 0..3 {
            track.predict();
            track.mark_missed(2, 5);
        }
        assert_eq!(track.state, TrackState::Stale);

        track.predict();
        track.update(&det(0.0), 7, 0.5, 3);
        assert_eq!(track.state, TrackState::Confirmed);

        for _ in 0..6 {
            track.predict();
            track.mark_missed(2, 5);
        }
        assert_eq!(track.state, TrackState::Deleted);
    }

    #[test]
    fn test_tentative_miss_resets_hits() {
        let mut track = Track::new(1, &det(0.0), 1);
        track.predict();
        track.update(&det(0.0), 2, 0.5, 3);
        track.predict();
        track.mark_missed(2, 5);
        assert_eq!(track.hits, 0);
        assert_eq!(track.state, TrackState::Tentative);
    }
}
