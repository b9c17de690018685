//! Identity association and lifecycle management.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use crate::TrackId;
use crate::reid::{Embedding, ReidCache};
use crate::tracker::matching::{self, AssignmentResult, Detection};
use crate::tracker::rect::{Rect, iou_batch};
use crate::tracker::snapshot::{
    DisappearedTrackSnapshot, InheritanceCandidate, SnapshotStore, assign_inheritance,
};
use crate::tracker::track::Track;
use crate::tracker::track_state::TrackState;

/// Configuration for the [`Tracker`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU for a geometric match
    pub iou_threshold: f32,
    /// Consecutive matches before a track is confirmed
    pub min_hits: u32,
    /// Missed frames before a track is deleted
    pub max_age: u32,
    /// Missed frames before a confirmed track stops being reported
    pub visibility_cutoff: u32,
    /// Minimum cosine similarity for Re-ID recovery
    pub similarity_threshold: f32,
    /// EMA weight of the newest box
    pub smoothing_alpha: f32,
    /// Search radius (px) for snapshot inheritance at `reference_box_height`
    pub snapshot_distance: f32,
    pub reference_box_height: f32,
    /// Frames a snapshot stays available after deletion
    pub snapshot_window: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            min_hits: 3,
            max_age: 30,
            visibility_cutoff: 5,
            similarity_threshold: 0.65,
            smoothing_alpha: 0.5,
            snapshot_distance: 100.0,
            reference_box_height: 200.0,
            snapshot_window: 10,
        }
    }
}

/// Identity transitions the tracker reports to owners of per-identity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A confirmed track was deleted; a snapshot now stands in for it.
    Lost { track_id: TrackId },
    /// A tentative track was dropped without ever being confirmed.
    Discarded { track_id: TrackId },
    /// A new track took over the identity state of a snapshot or of a
    /// confirmed track that went missing; `from` is retired.
    Inherited { from: TrackId, to: TrackId },
    /// A snapshot's window closed without a match.
    Expired { track_id: TrackId },
    /// A tentative track turned out to be a stale identity (by appearance)
    /// and was merged into it.
    Recovered { retired: TrackId, into: TrackId },
}

pub struct Tracker {
    tracks: Vec<Track>,
    snapshots: SnapshotStore,
    events: Vec<LifecycleEvent>,
    frame_id: u64,
    next_id: TrackId,
    config: TrackerConfig,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            snapshots: SnapshotStore::default(),
            events: Vec::new(),
            frame_id: 0,
            next_id: 1,
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Frames processed so far.
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Geometry-only update. See [`Tracker::update_with_reid`].
    pub fn update(&mut self, detections: Vec<Detection>) -> Vec<Track> {
        self.update_with_reid(detections, None)
    }

    /// Advance one frame and return the confirmed, visible tracks.
    ///
    /// Must be called for every processed frame, also with no detections,
    /// so ages and states keep advancing.
    pub fn update_with_reid(
        &mut self,
        detections: Vec<Detection>,
        reid: Option<&ReidCache>,
    ) -> Vec<Track> {
        self.frame_id += 1;
        let frame = self.frame_id;

        for track in &mut self.tracks {
            track.predict();
        }

        let track_rects: Vec<Rect> = self.tracks.iter().map(|t| t.smoothed_bbox).collect();
        let det_rects: Vec<Rect> = detections.iter().map(|d| d.bbox).collect();
        let ious = iou_batch(&track_rects, &det_rects);

        let mut assignment = matching::linear_assignment(&ious, self.config.iou_threshold);
        let primary = assignment.matches.len();
        matching::greedy_fallback(&ious, &mut assignment, self.config.iou_threshold);
        let geometric = assignment.matches.len();
        if let Some(reid) = reid {
            self.reid_association(&detections, reid, &mut assignment);
        }

        debug!(
            frame,
            tracks = self.tracks.len(),
            detections = detections.len(),
            primary,
            fallback = geometric - primary,
            reid = assignment.matches.len() - geometric,
            "association"
        );

        for &(ti, di) in &assignment.matches {
            self.tracks[ti].update(
                &detections[di],
                frame,
                self.config.smoothing_alpha,
                self.config.min_hits,
            );
        }

        let mut newly_lost = Vec::new();
        for &ti in &assignment.unmatched_tracks {
            let track = &mut self.tracks[ti];
            let established = track.state.is_established();
            track.mark_missed(self.config.visibility_cutoff, self.config.max_age);
            if track.state != TrackState::Deleted {
                continue;
            }
            if established {
                newly_lost.push(DisappearedTrackSnapshot {
                    track_id: track.id,
                    last_position: track.last_position,
                    last_height: track.smoothed_bbox.height,
                    last_seen_frame: track.last_seen_frame,
                    lost_frame: frame,
                });
            } else {
                self.events.push(LifecycleEvent::Discarded { track_id: track.id });
            }
        }

        for track_id in self.snapshots.expire(frame, self.config.snapshot_window) {
            debug!(track_id, frame, "snapshot expired");
            self.events.push(LifecycleEvent::Expired { track_id });
        }

        self.spawn_tracks(&detections, &assignment.unmatched_detections, frame);

        // Deleted this frame; offered to new detections from the next frame on.
        for snapshot in newly_lost {
            info!(track_id = snapshot.track_id, frame, "track lost");
            self.events.push(LifecycleEvent::Lost { track_id: snapshot.track_id });
            self.snapshots.insert(snapshot);
        }
        self.tracks.retain(|t| t.state != TrackState::Deleted);

        self.tracks
            .iter()
            .filter(|t| t.is_confirmed())
            .cloned()
            .collect()
    }

    /// Match leftover detections that carry an embedding against leftover
    /// tracks' cached embeddings.
    fn reid_association(
        &self,
        detections: &[Detection],
        reid: &ReidCache,
        assignment: &mut AssignmentResult,
    ) {
        let mut still_unmatched = Vec::new();
        for &di in &assignment.unmatched_detections {
            let Some(query) = detections[di].embedding.as_ref() else {
                still_unmatched.push(di);
                continue;
            };
            let candidates: Vec<TrackId> = assignment
                .unmatched_tracks
                .iter()
                .map(|&ti| self.tracks[ti].id)
                .collect();

            match reid.best_match(query, &candidates) {
                Some((track_id, similarity)) if similarity >= self.config.similarity_threshold => {
                    debug!(track_id, similarity, "re-identified detection");
                    let pos = candidates.iter().position(|&id| id == track_id);
                    if let Some(pos) = pos {
                        let ti = assignment.unmatched_tracks.remove(pos);
                        assignment.matches.push((ti, di));
                    }
                }
                _ => still_unmatched.push(di),
            }
        }
        assignment.unmatched_detections = still_unmatched;
    }

    /// Inheritance search radius around an identity last seen with a box
    /// of height `height`.
    fn inheritance_radius(&self, height: f32) -> f32 {
        let scale = if self.config.reference_box_height > 0.0 {
            (height / self.config.reference_box_height).clamp(0.5, 2.0)
        } else {
            1.0
        };
        self.config.snapshot_distance * scale
    }

    /// Create tracks for unmatched detections. A detection close to a
    /// snapshot, or to a confirmed track that went unmatched, continues that
    /// identity instead of starting a fresh one.
    fn spawn_tracks(&mut self, detections: &[Detection], unmatched: &[usize], frame: u64) {
        // (id, reference point, box height) of every identity that may be continued
        let sources: Vec<(TrackId, (f32, f32), f32)> = self
            .snapshots
            .iter()
            .map(|s| (s.track_id, s.last_position, s.last_height))
            .chain(
                self.tracks
                    .iter()
                    .filter(|t| t.state.is_established() && t.time_since_update > 0)
                    .map(|t| (t.id, t.last_position, t.smoothed_bbox.height)),
            )
            .collect();

        let mut candidates = Vec::new();
        for &di in unmatched {
            let (px, py) = detections[di].bbox.bottom_center();
            for &(source, (sx, sy), height) in &sources {
                let distance = ((px - sx).powi(2) + (py - sy).powi(2)).sqrt();
                if distance <= self.inheritance_radius(height) {
                    candidates.push(InheritanceCandidate {
                        detection: di,
                        source,
                        distance,
                    });
                }
            }
        }
        let inherit: HashMap<usize, TrackId> = assign_inheritance(candidates)
            .into_iter()
            .map(|c| (c.detection, c.source))
            .collect();

        for &di in unmatched {
            let id = self.allocate_id();
            let inherited = inherit.get(&di).and_then(|&from| self.take_identity(from));
            let track = match inherited {
                Some((from, last_seen_frame)) => {
                    info!(
                        from,
                        to = id,
                        gap = frame - last_seen_frame,
                        "track inherited identity"
                    );
                    self.events.push(LifecycleEvent::Inherited { from, to: id });
                    Track::inherited(id, &detections[di], frame, self.config.min_hits)
                }
                None => {
                    let mut track = Track::new(id, &detections[di], frame);
                    if self.config.min_hits <= 1 {
                        track.state = TrackState::Confirmed;
                    }
                    track
                }
            };
            self.tracks.push(track);
        }
    }

    /// Remove an identity about to be continued by a new track: its snapshot,
    /// or the live track itself when it was never deleted. Returns the id and
    /// the frame it was last matched.
    fn take_identity(&mut self, track_id: TrackId) -> Option<(TrackId, u64)> {
        if let Some(snapshot) = self.snapshots.take(track_id) {
            return Some((snapshot.track_id, snapshot.last_seen_frame));
        }
        let idx = self.tracks.iter().position(|t| t.id == track_id)?;
        let retired = self.tracks.remove(idx);
        Some((retired.id, retired.last_seen_frame))
    }

    /// Re-ID recovery for a tentative track whose embedding arrived after it
    /// was created. On a match against a stale identity the stale track takes
    /// over the tentative track's box and the tentative id is retired.
    ///
    /// Returns the id of the recovered identity.
    pub fn recover(
        &mut self,
        track_id: TrackId,
        embedding: &Embedding,
        reid: &ReidCache,
    ) -> Option<TrackId> {
        let idx = self
            .tracks
            .iter()
            .position(|t| t.id == track_id && t.state == TrackState::Tentative)?;

        let candidates: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|t| t.state.is_established() && t.time_since_update > 0)
            .map(|t| t.id)
            .collect();
        let (into, similarity) = reid.best_match(embedding, &candidates)?;
        if similarity < self.config.similarity_threshold {
            return None;
        }

        let target_idx = self.tracks.iter().position(|t| t.id == into)?;
        let tentative = self.tracks[idx].clone();
        let target = &mut self.tracks[target_idx];
        target.bbox = tentative.bbox;
        target.smoothed_bbox = tentative.smoothed_bbox;
        target.score = tentative.score;
        target.time_since_update = tentative.time_since_update;
        target.last_position = tentative.last_position;
        target.last_seen_frame = tentative.last_seen_frame;
        target.hits += tentative.hits;
        target.state = TrackState::Confirmed;
        self.tracks.remove(idx);

        info!(retired = track_id, into, similarity, "identity recovered by appearance");
        self.events.push(LifecycleEvent::Recovered {
            retired: track_id,
            into,
        });
        Some(into)
    }

    /// Close every open snapshot window, e.g. at channel shutdown.
    pub fn flush_snapshots(&mut self) {
        for track_id in self.snapshots.drain() {
            self.events.push(LifecycleEvent::Expired { track_id });
        }
    }

    /// Lifecycle events accumulated since the last call.
    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    /// All live tracks, whatever their state.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == track_id)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &DisappearedTrackSnapshot> {
        self.snapshots.iter()
    }

    /// Whether any confirmed identity is currently unmatched, i.e. whether a
    /// new track could be a returning identity.
    pub fn has_missing(&self) -> bool {
        self.tracks
            .iter()
            .any(|t| t.state.is_established() && t.time_since_update > 0)
    }

    fn allocate_id(&mut self) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
