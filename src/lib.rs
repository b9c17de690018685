//! Per-channel person tracking and zone counting.
//!
//! The crate turns a noisy, high-frequency stream of person detections into
//! stable identities, stabilized per-identity classifications and
//! enter/exit counts for configured zones. Each video channel runs its own
//! [`ChannelPipeline`]: a frame producer, detection and model worker pools,
//! a sink writer pool and a single coordinator thread that owns all tracking
//! state.

pub mod classify;
pub mod error;
pub mod pipeline;
pub mod reid;
pub mod tracker;
pub mod zone;

pub use classify::{Decision, Label, Stabilizer, StabilizerConfig};
pub use error::{CollaboratorError, Error, Result, SinkError};
pub use pipeline::{
    ChannelContext, ChannelHandle, ChannelPipeline, Collaborators, DetectionBuilder, Frame,
    PipelineConfig,
};
pub use reid::{Embedding, ReidCache, ReidConfig};
pub use tracker::{Detection, LifecycleEvent, Rect, Track, TrackState, Tracker, TrackerConfig};
pub use zone::{ZoneCount, ZoneCounter, ZoneDefinition, ZoneEvent, load_zones};

/// Identity assigned by a [`Tracker`]; unique within one channel.
pub type TrackId = u64;
