//! Short-lived memory of deleted identities, offered to new tracks that
//! appear nearby so they continue the old identity's zone and vote state.

use std::collections::BTreeMap;

use crate::TrackId;

/// Last known whereabouts of a deleted, previously confirmed track.
///
/// Zone membership and vote state stay in their owning components, keyed by
/// `track_id`; inheriting a snapshot moves them to the new id.
#[derive(Debug, Clone, PartialEq)]
pub struct DisappearedTrackSnapshot {
    pub track_id: TrackId,
    /// Bottom-centre reference point at the last match
    pub last_position: (f32, f32),
    /// Smoothed box height at the last match; scales the search radius
    pub last_height: f32,
    pub last_seen_frame: u64,
    /// Tracker frame at which the track was deleted
    pub lost_frame: u64,
}

/// Snapshots ordered by track id so iteration (and tie-breaking) is
/// reproducible.
#[derive(Debug, Default)]
pub(crate) struct SnapshotStore {
    snapshots: BTreeMap<TrackId, DisappearedTrackSnapshot>,
}

impl SnapshotStore {
    pub fn insert(&mut self, snapshot: DisappearedTrackSnapshot) {
        self.snapshots.insert(snapshot.track_id, snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisappearedTrackSnapshot> {
        self.snapshots.values()
    }

    pub fn take(&mut self, track_id: TrackId) -> Option<DisappearedTrackSnapshot> {
        self.snapshots.remove(&track_id)
    }

    /// Remove and return the ids of snapshots lost more than `window` frames
    /// before `frame`.
    pub fn expire(&mut self, frame: u64, window: u64) -> Vec<TrackId> {
        let expired: Vec<TrackId> = self
            .snapshots
            .values()
            .filter(|s| frame.saturating_sub(s.lost_frame) > window)
            .map(|s| s.track_id)
            .collect();
        for id in &expired {
            self.snapshots.remove(id);
        }
        expired
    }

    pub fn drain(&mut self) -> Vec<TrackId> {
        std::mem::take(&mut self.snapshots).into_keys().collect()
    }
}

/// Candidate pairing of an unmatched detection with an identity it may
/// continue: a snapshot, or a confirmed track that missed this frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InheritanceCandidate {
    pub detection: usize,
    pub source: TrackId,
    pub distance: f32,
}

/// Pair detections with sources one-to-one, closest first; ties go to the
/// lowest source id, then the lowest detection index.
pub(crate) fn assign_inheritance(mut candidates: Vec<InheritanceCandidate>) -> Vec<InheritanceCandidate> {
    candidates.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.source.cmp(&b.source))
            .then(a.detection.cmp(&b.detection))
    });

    let mut used_detections = std::collections::HashSet::new();
    let mut used_sources = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| {
            if used_detections.contains(&c.detection) || used_sources.contains(&c.source) {
                return false;
            }
            used_detections.insert(c.detection);
            used_sources.insert(c.source);
            true
        })
        .collect()
}
