mod matching;
mod person_tracker;
mod rect;
mod snapshot;
mod track;
mod track_state;

pub use matching::{AssignmentResult, Detection, greedy_fallback, linear_assignment};
pub use person_tracker::{LifecycleEvent, Tracker, TrackerConfig};
pub use rect::{Rect, iou_batch};
pub use snapshot::DisappearedTrackSnapshot;
pub use track::Track;
pub use track_state::TrackState;
