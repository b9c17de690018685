//! Zone counting.
//!
//! Zones are polygons (inside/outside by ray casting) or lines (crossing by
//! side change through the segment). Each identity holds a confirmed
//! membership flag per zone that only flips after `enter_threshold` or
//! `exit_threshold` consecutive agreeing frames, and each (identity, zone)
//! pair remembers its last counted event so one physical crossing is
//! counted once.

mod config;
mod counter;
mod event;
mod geometry;

pub use config::{CoordinateType, LineDirection, ZoneDefinition, ZoneKind, ZoneShape, load_zones};
pub use counter::{Overlay, TrackedIdentity, ZoneCounter, ZoneCounterConfig, ZoneUpdate};
pub use event::{EventKind, ExitReason, ZoneCount, ZoneEvent};
pub use geometry::{ResolvedShape, Side, point_in_polygon, segments_intersect, side_of};

pub(crate) use counter::now_ms;
