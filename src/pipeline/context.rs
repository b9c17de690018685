//! Single-threaded coordinator state of one channel.
//!
//! Tracker, Re-ID cache, stabilizer, zone counter and the model schedulers
//! are only ever touched from here. The threaded pipeline drives a
//! `ChannelContext` from its coordinator thread; tests drive it directly.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::TrackId;
use crate::classify::{ClassifyScheduler, Decision, Priority, Stabilizer};
use crate::error::Result;
use crate::pipeline::collaborator::Classification;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::frame::FrameMeta;
use crate::pipeline::sink::{ClassificationRecord, SinkRecord};
use crate::reid::{EmbedScheduler, Embedding, ReidCache};
use crate::tracker::{Detection, LifecycleEvent, Rect, Track, TrackState, Tracker};
use crate::zone::{TrackedIdentity, ZoneCount, ZoneCounter, ZoneDefinition, ZoneEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Classify,
    Embed,
}

/// Work the coordinator wants done on a crop of the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub kind: ModelKind,
    pub track_id: TrackId,
    pub priority: Priority,
    pub bbox: Rect,
}

/// Everything that came out of one processed frame.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    pub frame: u64,
    /// Confirmed, visible tracks
    pub tracks: Vec<Track>,
    pub events: Vec<ZoneEvent>,
    pub requests: Vec<ModelRequest>,
    pub counts: BTreeMap<String, ZoneCount>,
}

impl FrameOutcome {
    pub fn records(&self) -> impl Iterator<Item = SinkRecord> + '_ {
        self.events.iter().cloned().map(SinkRecord::Zone)
    }
}

pub struct ChannelContext {
    channel_id: String,
    tracker: Tracker,
    reid: ReidCache,
    stabilizer: Stabilizer,
    zones: ZoneCounter,
    classify_scheduler: ClassifyScheduler,
    embed_scheduler: EmbedScheduler,
    classify_enabled: bool,
    embed_enabled: bool,
    last_frame: Option<FrameMeta>,
}

impl ChannelContext {
    pub fn new(
        channel_id: impl Into<String>,
        config: &PipelineConfig,
        zones: Vec<ZoneDefinition>,
    ) -> Result<Self> {
        Ok(Self {
            channel_id: channel_id.into(),
            tracker: Tracker::new(config.tracker.clone()),
            reid: ReidCache::new(config.reid.clone()),
            stabilizer: Stabilizer::new(config.stabilizer.clone()),
            zones: ZoneCounter::new(zones, config.zones.clone())?,
            classify_scheduler: ClassifyScheduler::new(config.classify.clone()),
            embed_scheduler: EmbedScheduler::new(
                config.reid.refresh_interval,
                config.reid.max_per_frame,
            ),
            classify_enabled: true,
            embed_enabled: true,
            last_frame: None,
        })
    }

    /// Turn model request scheduling on or off, e.g. when no backend exists.
    pub fn with_models(mut self, classify: bool, embed: bool) -> Self {
        self.classify_enabled = classify;
        self.embed_enabled = embed;
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Index of the newest processed frame.
    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame.map(|m| m.index)
    }

    /// Run one frame of detections through tracking and zone counting.
    ///
    /// Results for a frame at or before the newest processed one are
    /// discarded (`None`), so late workers cannot reorder the stream.
    pub fn process_detections(
        &mut self,
        meta: FrameMeta,
        detections: Vec<Detection>,
    ) -> Option<FrameOutcome> {
        if let Some(last) = self.last_frame
            && meta.index <= last.index
        {
            debug!(channel = %self.channel_id, frame = meta.index, last = last.index, "stale detection result discarded");
            return None;
        }
        self.last_frame = Some(meta);
        self.stabilizer.advance(meta.index);
        self.zones.ensure_resolved(meta.width, meta.height);

        let tracks = self.tracker.update_with_reid(detections, Some(&self.reid));
        let mut events = self.relay_lifecycle(meta);

        let identities: Vec<TrackedIdentity> = tracks
            .iter()
            .map(|t| TrackedIdentity::from_track(t).with_label(self.stabilizer.current(t.id)))
            .collect();
        let update = self.zones.update_at(&identities, meta.index, meta.timestamp_ms);
        events.extend(update.events);

        let requests = self.schedule(meta.index, &tracks);
        self.reid.purge_expired();

        Some(FrameOutcome {
            frame: meta.index,
            tracks,
            events,
            requests,
            counts: update.counts,
        })
    }

    fn schedule(&mut self, frame: u64, tracks: &[Track]) -> Vec<ModelRequest> {
        let bbox_of = |id: TrackId| tracks.iter().find(|t| t.id == id).map(|t| t.bbox);
        let mut requests = Vec::new();

        if self.classify_enabled {
            let candidates: Vec<(TrackId, bool)> = tracks
                .iter()
                .map(|t| (t.id, self.stabilizer.is_fixed(t.id)))
                .collect();
            for (track_id, priority) in self.classify_scheduler.select(frame, candidates) {
                if let Some(bbox) = bbox_of(track_id) {
                    requests.push(ModelRequest {
                        kind: ModelKind::Classify,
                        track_id,
                        priority,
                        bbox,
                    });
                }
            }
        }

        if self.embed_enabled {
            // Tentative tracks are only worth embedding while some confirmed
            // identity is missing that they could turn out to be.
            let recovering = self.tracker.has_missing();
            let tentative: Vec<&Track> = if recovering {
                self.tracker
                    .tracks()
                    .iter()
                    .filter(|t| t.state == TrackState::Tentative && t.time_since_update == 0)
                    .collect()
            } else {
                Vec::new()
            };
            let candidates = tentative
                .iter()
                .map(|t| t.id)
                .chain(tracks.iter().map(|t| t.id));
            for track_id in self.embed_scheduler.select(frame, candidates) {
                let tentative_box = tentative.iter().find(|t| t.id == track_id).map(|t| t.bbox);
                let (bbox, priority) = match tentative_box {
                    Some(bbox) => (bbox, Priority::New),
                    None => match bbox_of(track_id) {
                        Some(bbox) => (bbox, Priority::Refresh),
                        None => continue,
                    },
                };
                requests.push(ModelRequest {
                    kind: ModelKind::Embed,
                    track_id,
                    priority,
                    bbox,
                });
            }
        }
        requests
    }

    /// Propagate tracker lifecycle events to every per-identity store.
    fn relay_lifecycle(&mut self, meta: FrameMeta) -> Vec<ZoneEvent> {
        let mut events = Vec::new();
        for event in self.tracker.drain_events() {
            match event {
                LifecycleEvent::Lost { track_id } => {
                    self.zones.identity_lost(track_id, meta.index);
                }
                LifecycleEvent::Inherited { from, to } => {
                    self.zones.identity_inherited(from, to);
                    self.stabilizer.transfer(from, to);
                    self.reid.transfer(from, to);
                    self.classify_scheduler.transfer(from, to);
                    self.embed_scheduler.transfer(from, to);
                }
                LifecycleEvent::Expired { track_id } => {
                    events.extend(self.zones.identity_expired_at(
                        track_id,
                        meta.index,
                        meta.timestamp_ms,
                    ));
                    self.forget(track_id);
                }
                LifecycleEvent::Discarded { track_id } => self.forget(track_id),
                LifecycleEvent::Recovered { retired, into } => {
                    debug!(channel = %self.channel_id, retired, into, "identity recovered");
                    self.forget(retired);
                }
            }
        }
        events
    }

    fn forget(&mut self, track_id: TrackId) {
        self.zones.forget(track_id);
        self.stabilizer.forget(track_id);
        self.reid.remove(track_id);
        self.classify_scheduler.forget(track_id);
        self.embed_scheduler.forget(track_id);
    }

    /// Feed one classifier result into the stabilizer. Returns a record when
    /// the identity's fixed label was set or changed by this observation.
    pub fn apply_classification(
        &mut self,
        track_id: TrackId,
        frame: u64,
        result: &Classification,
    ) -> Option<SinkRecord> {
        if self.tracker.get(track_id).is_none() {
            debug!(channel = %self.channel_id, track_id, "classification for retired track ignored");
            return None;
        }
        let before = self.stabilizer.current(track_id);
        let decision = self
            .stabilizer
            .observe(track_id, &result.label, result.confidence);
        if !decision.is_fixed || (before.is_fixed && before.label == decision.label) {
            return None;
        }
        info!(channel = %self.channel_id, track_id, label = %decision.label, "classification fixed");
        Some(SinkRecord::Classification(ClassificationRecord {
            track_id,
            label: decision.label,
            confidence: decision.confidence,
            frame,
            timestamp: self.last_frame.map_or(0, |m| m.timestamp_ms),
        }))
    }

    /// Store an embedding. For a tentative track this first tries to
    /// recover a missing identity; returns the recovered id on success
    /// along with any events the merge produced.
    pub fn apply_embedding(
        &mut self,
        track_id: TrackId,
        embedding: Embedding,
    ) -> (Option<TrackId>, Vec<ZoneEvent>) {
        let Some(state) = self.tracker.get(track_id).map(|t| t.state) else {
            debug!(channel = %self.channel_id, track_id, "embedding for retired track ignored");
            return (None, Vec::new());
        };
        if state != TrackState::Tentative {
            self.reid.set(track_id, embedding);
            return (None, Vec::new());
        }

        match self.tracker.recover(track_id, &embedding, &self.reid) {
            Some(into) => {
                self.reid.set(into, embedding);
                let events = match self.last_frame {
                    Some(meta) => self.relay_lifecycle(meta),
                    None => Vec::new(),
                };
                (Some(into), events)
            }
            None => {
                self.reid.set(track_id, embedding);
                (None, Vec::new())
            }
        }
    }

    /// A model task was dropped, timed out or failed: let the identity be
    /// scheduled again.
    pub fn model_failed(&mut self, kind: ModelKind, track_id: TrackId) {
        match kind {
            ModelKind::Classify => self.classify_scheduler.release(track_id),
            ModelKind::Embed => self.embed_scheduler.release(track_id),
        }
    }

    /// Close every pending inheritance window, emitting the deferred
    /// identity-lost exits. Called once when the channel stops.
    pub fn finish(&mut self) -> Vec<ZoneEvent> {
        self.tracker.flush_snapshots();
        match self.last_frame {
            Some(meta) => self.relay_lifecycle(meta),
            None => Vec::new(),
        }
    }

    pub fn decision(&self, track_id: TrackId) -> Decision {
        self.stabilizer.current(track_id)
    }

    pub fn counts(&self) -> BTreeMap<String, ZoneCount> {
        self.zones.counts()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn zones(&self) -> &ZoneCounter {
        &self.zones
    }

    pub fn reid(&self) -> &ReidCache {
        &self.reid
    }

    pub fn stabilizer(&self) -> &Stabilizer {
        &self.stabilizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerConfig;

    fn meta(index: u64) -> FrameMeta {
        FrameMeta {
            index,
            timestamp_ms: index * 40,
            width: 640,
            height: 480,
        }
    }

    fn person(x: f32) -> Detection {
        Detection::new(x, 100.0, x + 50.0, 300.0, 0.9)
    }

    fn context() -> ChannelContext {
        let config = PipelineConfig {
            tracker: TrackerConfig {
                min_hits: 1,
                ..TrackerConfig::default()
            },
            ..PipelineConfig::default()
        };
        ChannelContext::new("cam-1", &config, Vec::new()).unwrap()
    }

    #[test]
    fn test_out_of_order_results_are_discarded() {
        let mut ctx = context();
        assert!(ctx.process_detections(meta(5), vec![person(10.0)]).is_some());
        assert!(ctx.process_detections(meta(5), vec![person(10.0)]).is_none());
        assert!(ctx.process_detections(meta(3), vec![person(10.0)]).is_none());
        assert!(ctx.process_detections(meta(6), vec![person(10.0)]).is_some());
        assert_eq!(ctx.last_frame(), Some(6));
    }

    #[test]
    fn test_classification_record_on_fix_only() {
        let mut ctx = context();
        let outcome = ctx.process_detections(meta(1), vec![person(10.0)]).unwrap();
        let id = outcome.tracks[0].id;
        assert!(outcome
            .requests
            .iter()
            .any(|r| r.kind == ModelKind::Classify && r.track_id == id));

        let result = Classification::new("customer", 0.95);
        let records: Vec<_> = (0..6)
            .filter_map(|_| ctx.apply_classification(id, 1, &result))
            .collect();
        assert_eq!(records.len(), 1);
        assert!(ctx.decision(id).is_fixed);
    }

    #[test]
    fn test_unknown_track_results_ignored() {
        let mut ctx = context();
        ctx.process_detections(meta(1), vec![]).unwrap();
        assert!(ctx
            .apply_classification(99, 1, &Classification::new("staff", 0.99))
            .is_none());
        let (recovered, events) = ctx.apply_embedding(99, Embedding::new(vec![1.0, 0.0]));
        assert!(recovered.is_none() && events.is_empty());
        assert!(ctx.reid().is_empty());
    }

    #[test]
    fn test_models_can_be_disabled() {
        let mut ctx = context().with_models(false, false);
        let outcome = ctx.process_detections(meta(1), vec![person(10.0)]).unwrap();
        assert!(outcome.requests.is_empty());
    }
}
