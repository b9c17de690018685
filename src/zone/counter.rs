//! Per-identity zone membership with flicker protection and deduplicated
//! enter/exit counting.

use std::collections::{BTreeMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use nalgebra::Point2;
use serde::Deserialize;
use tracing::{debug, info};

use crate::TrackId;
use crate::classify::Decision;
use crate::error::{Error, Result};
use crate::tracker::Track;
use crate::zone::config::ZoneDefinition;
use crate::zone::event::{EventKind, ExitReason, ZoneCount, ZoneEvent};
use crate::zone::geometry::{self, ResolvedShape, Side};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZoneCounterConfig {
    /// Identities whose fixed label is listed here are not counted
    pub excluded_labels: Vec<String>,
}

/// One identity's position for a counter update.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedIdentity {
    pub track_id: TrackId,
    /// Reference point, bottom-centre of the box for tracker output
    pub position: (f32, f32),
    pub label: Option<Decision>,
}

impl TrackedIdentity {
    pub fn new(track_id: TrackId, position: (f32, f32)) -> Self {
        Self {
            track_id,
            position,
            label: None,
        }
    }

    pub fn from_track(track: &Track) -> Self {
        Self::new(track.id, track.smoothed_bbox.bottom_center())
    }

    pub fn with_label(mut self, label: Decision) -> Self {
        self.label = Some(label);
        self
    }
}

/// Result of one counter update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneUpdate {
    pub events: Vec<ZoneEvent>,
    pub counts: BTreeMap<String, ZoneCount>,
}

/// Receives zone geometry and labels for display.
pub trait Overlay {
    fn polyline(&mut self, zone_id: &str, points: &[(f32, f32)], closed: bool);
    fn text(&mut self, at: (f32, f32), text: &str);
}

/// Membership of one identity in one zone.
#[derive(Debug, Clone, Default)]
struct Membership {
    /// Confirmed inside flag; for lines, the last confirmed crossing was an enter
    inside: bool,
    /// Consecutive frames contradicting the confirmed state
    streak: u32,
    /// Confirmed side of a line zone
    line_side: Option<Side>,
    /// The pending side change started with a segment crossing
    crossed: bool,
    last_point: Option<Point2<f32>>,
    last_counted: Option<EventKind>,
}

#[derive(Debug, Clone)]
struct IdentityState {
    zones: Vec<Membership>,
    last_frame: u64,
}

impl IdentityState {
    fn new(zone_count: usize) -> Self {
        Self {
            zones: vec![Membership::default(); zone_count],
            last_frame: 0,
        }
    }

    fn inside_any(&self) -> bool {
        self.zones.iter().any(|m| m.inside)
    }
}

#[derive(Debug, Clone)]
struct PendingLoss {
    state: IdentityState,
    lost_frame: u64,
}

#[derive(Debug, Clone)]
struct ZoneSlot {
    definition: ZoneDefinition,
    shape: Option<ResolvedShape>,
    count: ZoneCount,
}

pub struct ZoneCounter {
    zones: Vec<ZoneSlot>,
    live: BTreeMap<TrackId, IdentityState>,
    /// Lost identities waiting for inheritance or expiry; not counted in `current`
    pending: BTreeMap<TrackId, PendingLoss>,
    excluded: HashSet<TrackId>,
    config: ZoneCounterConfig,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ZoneCounter {
    pub fn new(definitions: Vec<ZoneDefinition>, config: ZoneCounterConfig) -> Result<Self> {
        let mut seen = HashSet::new();
        for definition in &definitions {
            definition.validate()?;
            if !seen.insert(definition.zone_id.as_str()) {
                return Err(Error::invalid_zone(&definition.zone_id, "duplicate zone_id"));
            }
        }
        let zones = definitions
            .into_iter()
            .map(|definition| ZoneSlot {
                definition,
                shape: None,
                count: ZoneCount::default(),
            })
            .collect();
        Ok(Self {
            zones,
            live: BTreeMap::new(),
            pending: BTreeMap::new(),
            excluded: HashSet::new(),
            config,
        })
    }

    /// Resolve percentage geometry against the stream's frame size. Only the
    /// first call has an effect.
    pub fn ensure_resolved(&mut self, frame_width: u32, frame_height: u32) {
        for zone in self.zones.iter_mut().filter(|z| z.shape.is_none()) {
            let shape = ResolvedShape::resolve(
                &zone.definition.shape,
                zone.definition.coordinate_type,
                frame_width,
                frame_height,
            );
            debug!(zone_id = %zone.definition.zone_id, frame_width, frame_height, "zone resolved");
            zone.shape = Some(shape);
        }
    }

    pub fn resolved(&self) -> bool {
        self.zones.iter().all(|z| z.shape.is_some())
    }

    pub fn update(&mut self, identities: &[TrackedIdentity], frame: u64) -> ZoneUpdate {
        self.update_at(identities, frame, now_ms())
    }

    /// Advance membership for the identities seen on `frame`. Identities not
    /// listed keep their state until they are reported lost or forgotten.
    pub fn update_at(
        &mut self,
        identities: &[TrackedIdentity],
        frame: u64,
        timestamp_ms: u64,
    ) -> ZoneUpdate {
        let mut events = Vec::new();

        for identity in identities {
            let id = identity.track_id;
            if self.is_excluded(identity) {
                if self.excluded.insert(id) {
                    info!(track_id = id, "identity excluded from zone counting");
                    if let Some(mut state) = self.live.remove(&id) {
                        let stamp = Stamp {
                            track_id: id,
                            frame,
                            timestamp_ms,
                            reason: Some(ExitReason::Excluded),
                        };
                        events.extend(close_memberships(&mut self.zones, &mut state, &stamp));
                    }
                }
                continue;
            }

            let zone_count = self.zones.len();
            let state = self
                .live
                .entry(id)
                .or_insert_with(|| IdentityState::new(zone_count));
            state.last_frame = frame;
            let point = Point2::new(identity.position.0, identity.position.1);

            for (zone, membership) in self.zones.iter_mut().zip(state.zones.iter_mut()) {
                let Some(shape) = &zone.shape else {
                    continue;
                };
                let transition = match shape {
                    ResolvedShape::Polygon(polygon) => step_polygon(
                        membership,
                        geometry::point_in_polygon(point, polygon),
                        &zone.definition,
                    ),
                    ResolvedShape::Line {
                        start,
                        end,
                        enter_side,
                    } => step_line(membership, point, (*start, *end), *enter_side, &zone.definition),
                };
                let Some(kind) = transition else {
                    continue;
                };
                let stamp = Stamp {
                    track_id: id,
                    frame,
                    timestamp_ms,
                    reason: None,
                };
                if let Some(event) = count_event(zone, membership, kind, stamp) {
                    events.push(event);
                }
            }
        }

        self.recount();
        ZoneUpdate {
            events,
            counts: self.counts(),
        }
    }

    fn is_excluded(&self, identity: &TrackedIdentity) -> bool {
        if self.excluded.contains(&identity.track_id) {
            return true;
        }
        identity.label.as_ref().is_some_and(|decision| {
            decision.is_fixed
                && self
                    .config
                    .excluded_labels
                    .iter()
                    .any(|l| l == decision.label.as_str())
        })
    }

    fn recount(&mut self) {
        for (index, zone) in self.zones.iter_mut().enumerate() {
            zone.count.current = self
                .live
                .values()
                .filter(|state| state.zones[index].inside)
                .count() as u64;
        }
    }

    /// The identity's track was deleted. Its membership is parked, and its
    /// exits deferred, until it is inherited or expires.
    pub fn identity_lost(&mut self, track_id: TrackId, frame: u64) {
        if let Some(state) = self.live.remove(&track_id) {
            if state.inside_any() {
                info!(track_id, frame, "zone exit deferred for lost identity");
            }
            self.pending.insert(
                track_id,
                PendingLoss {
                    state,
                    lost_frame: frame,
                },
            );
            self.recount();
        }
    }

    /// A new track continues a lost identity: membership moves over
    /// silently, so the gap produces no events.
    pub fn identity_inherited(&mut self, from: TrackId, to: TrackId) {
        if self.excluded.remove(&from) {
            self.excluded.insert(to);
        }
        let state = match self.pending.remove(&from) {
            Some(pending) => {
                debug!(from, to, lost_frame = pending.lost_frame, "zone membership inherited");
                Some(pending.state)
            }
            None => self.live.remove(&from),
        };
        if let Some(state) = state {
            self.live.insert(to, state);
            self.recount();
        }
    }

    pub fn identity_expired(&mut self, track_id: TrackId, frame: u64) -> Vec<ZoneEvent> {
        self.identity_expired_at(track_id, frame, now_ms())
    }

    /// The inheritance window closed: emit the deferred exits.
    pub fn identity_expired_at(
        &mut self,
        track_id: TrackId,
        frame: u64,
        timestamp_ms: u64,
    ) -> Vec<ZoneEvent> {
        self.excluded.remove(&track_id);
        let Some(mut pending) = self.pending.remove(&track_id) else {
            return Vec::new();
        };
        let stamp = Stamp {
            track_id,
            frame,
            timestamp_ms,
            reason: Some(ExitReason::IdentityLost),
        };
        let events = close_memberships(&mut self.zones, &mut pending.state, &stamp);
        self.recount();
        events
    }

    /// Drop every trace of an identity without emitting events.
    pub fn forget(&mut self, track_id: TrackId) {
        self.live.remove(&track_id);
        self.pending.remove(&track_id);
        self.excluded.remove(&track_id);
        self.recount();
    }

    pub fn counts(&self) -> BTreeMap<String, ZoneCount> {
        self.zones
            .iter()
            .map(|z| (z.definition.zone_id.clone(), z.count))
            .collect()
    }

    pub fn count(&self, zone_id: &str) -> Option<ZoneCount> {
        self.zone(zone_id).map(|(_, z)| z.count)
    }

    /// Live identities confirmed inside `zone_id`.
    pub fn memberships(&self, zone_id: &str) -> Vec<TrackId> {
        let Some((index, _)) = self.zone(zone_id) else {
            return Vec::new();
        };
        self.live
            .iter()
            .filter(|(_, state)| state.zones[index].inside)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Last frame each live identity was reported on.
    pub fn last_seen(&self, track_id: TrackId) -> Option<u64> {
        self.live.get(&track_id).map(|s| s.last_frame)
    }

    pub fn pending_losses(&self) -> usize {
        self.pending.len()
    }

    pub fn zone_ids(&self) -> impl Iterator<Item = &str> {
        self.zones.iter().map(|z| z.definition.zone_id.as_str())
    }

    fn zone(&self, zone_id: &str) -> Option<(usize, &ZoneSlot)> {
        self.zones
            .iter()
            .enumerate()
            .find(|(_, z)| z.definition.zone_id == zone_id)
    }

    /// Render resolved zones and their counts.
    pub fn draw(&self, overlay: &mut impl Overlay) {
        for zone in &self.zones {
            let Some(shape) = &zone.shape else {
                continue;
            };
            let outline = shape.outline();
            let closed = matches!(shape, ResolvedShape::Polygon(_));
            overlay.polyline(&zone.definition.zone_id, &outline, closed);
            if let Some(&anchor) = outline.first() {
                let c = zone.count;
                let label = format!(
                    "{} in:{} out:{} now:{}",
                    zone.definition.display_name(),
                    c.enter,
                    c.exit,
                    c.current
                );
                overlay.text(anchor, &label);
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Stamp {
    track_id: TrackId,
    frame: u64,
    timestamp_ms: u64,
    reason: Option<ExitReason>,
}

/// Exit every zone the identity is confirmed inside, tagged with the
/// stamp's reason.
fn close_memberships(zones: &mut [ZoneSlot], state: &mut IdentityState, stamp: &Stamp) -> Vec<ZoneEvent> {
    let mut events = Vec::new();
    for (zone, membership) in zones.iter_mut().zip(state.zones.iter_mut()) {
        if !membership.inside {
            continue;
        }
        membership.inside = false;
        if let Some(event) = count_event(zone, membership, EventKind::Exit, *stamp) {
            events.push(event);
        }
    }
    events
}

/// Flicker-protected polygon membership: the raw inside flag must disagree
/// with the confirmed one for the zone's threshold of consecutive frames.
fn step_polygon(m: &mut Membership, raw_inside: bool, zone: &ZoneDefinition) -> Option<EventKind> {
    if raw_inside == m.inside {
        m.streak = 0;
        return None;
    }
    m.streak += 1;
    let needed = if raw_inside {
        zone.enter_threshold
    } else {
        zone.exit_threshold
    };
    if m.streak < needed {
        return None;
    }
    m.streak = 0;
    m.inside = raw_inside;
    Some(if raw_inside {
        EventKind::Enter
    } else {
        EventKind::Exit
    })
}

/// Line crossing: the side must change through the segment itself and hold
/// for the threshold of frames. The first observation only fixes the side.
fn step_line(
    m: &mut Membership,
    point: Point2<f32>,
    (start, end): (Point2<f32>, Point2<f32>),
    enter_side: Side,
    zone: &ZoneDefinition,
) -> Option<EventKind> {
    let previous = m.last_point.replace(point);
    let side = geometry::side_of(start, end, point)?;
    let Some(confirmed) = m.line_side else {
        m.line_side = Some(side);
        return None;
    };
    if side == confirmed {
        m.streak = 0;
        m.crossed = false;
        return None;
    }
    if m.streak == 0 {
        m.crossed =
            previous.is_some_and(|prev| geometry::segments_intersect(prev, point, start, end));
    }
    m.streak += 1;

    let entering = side == enter_side;
    let needed = if entering {
        zone.enter_threshold
    } else {
        zone.exit_threshold
    };
    if m.streak < needed {
        return None;
    }
    m.streak = 0;
    m.line_side = Some(side);
    if !std::mem::take(&mut m.crossed) {
        debug!(zone_id = %zone.zone_id, "side change outside the line segment ignored");
        return None;
    }
    m.inside = entering;
    Some(if entering {
        EventKind::Enter
    } else {
        EventKind::Exit
    })
}

fn count_event(
    zone: &mut ZoneSlot,
    m: &mut Membership,
    kind: EventKind,
    stamp: Stamp,
) -> Option<ZoneEvent> {
    let zone_id = &zone.definition.zone_id;
    if m.last_counted == Some(kind) {
        debug!(zone_id = %zone_id, track_id = stamp.track_id, ?kind, "repeated event suppressed");
        return None;
    }
    m.last_counted = Some(kind);
    zone.count.record(kind);
    info!(
        zone_id = %zone_id,
        track_id = stamp.track_id,
        frame = stamp.frame,
        ?kind,
        reason = ?stamp.reason,
        "zone event"
    );
    Some(ZoneEvent {
        kind,
        zone_id: zone_id.clone(),
        track_id: stamp.track_id,
        frame: stamp.frame,
        timestamp_ms: stamp.timestamp_ms,
        reason: stamp.reason,
    })
}
