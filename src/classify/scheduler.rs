use std::collections::HashMap;

use serde::Deserialize;

use crate::TrackId;

/// Urgency of a classification request. Higher variants are served first
/// and are the last to be dropped when the task queue saturates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Periodic re-check of an identity whose label is already fixed
    Refresh,
    /// Identity still collecting votes
    Unfixed,
    /// Identity never classified
    New,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifyScheduleConfig {
    pub max_per_frame: usize,
    /// Frames between requests while a label is not fixed yet
    pub unfixed_interval: u64,
    /// Frames between requests once fixed; `0` disables refreshes
    pub refresh_interval: u64,
}

impl Default for ClassifyScheduleConfig {
    fn default() -> Self {
        Self {
            max_per_frame: 4,
            unfixed_interval: 3,
            refresh_interval: 90,
        }
    }
}

/// Decides which identities are sent for classification each frame.
#[derive(Debug, Clone)]
pub struct ClassifyScheduler {
    last_requested: HashMap<TrackId, u64>,
    config: ClassifyScheduleConfig,
}

impl ClassifyScheduler {
    pub fn new(config: ClassifyScheduleConfig) -> Self {
        Self {
            last_requested: HashMap::new(),
            config,
        }
    }

    /// `candidates` are `(track_id, label_is_fixed)` pairs for the visible
    /// identities. Returns the picked requests, most urgent first, and
    /// records them.
    pub fn select(
        &mut self,
        frame: u64,
        candidates: impl IntoIterator<Item = (TrackId, bool)>,
    ) -> Vec<(TrackId, Priority)> {
        let mut due: Vec<(Priority, u64, TrackId)> = candidates
            .into_iter()
            .filter_map(|(id, fixed)| {
                let Some(&last) = self.last_requested.get(&id) else {
                    return Some((Priority::New, 0, id));
                };
                let elapsed = frame.saturating_sub(last);
                if !fixed && elapsed >= self.config.unfixed_interval {
                    Some((Priority::Unfixed, last, id))
                } else if fixed
                    && self.config.refresh_interval > 0
                    && elapsed >= self.config.refresh_interval
                {
                    Some((Priority::Refresh, last, id))
                } else {
                    None
                }
            })
            .collect();

        // Most urgent first, then longest waiting, then lowest id.
        due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        due.truncate(self.config.max_per_frame);

        for &(_, _, id) in &due {
            self.last_requested.insert(id, frame);
        }
        due.into_iter().map(|(p, _, id)| (id, p)).collect()
    }

    /// Make an identity eligible again immediately, e.g. after its task was
    /// dropped or timed out.
    pub fn release(&mut self, track_id: TrackId) {
        self.last_requested.remove(&track_id);
    }

    pub fn transfer(&mut self, from: TrackId, to: TrackId) {
        if let Some(at) = self.last_requested.remove(&from) {
            self.last_requested.insert(to, at);
        }
    }

    pub fn forget(&mut self, track_id: TrackId) {
        self.last_requested.remove(&track_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_identities_first() {
        let mut scheduler = ClassifyScheduler::new(ClassifyScheduleConfig {
            max_per_frame: 2,
            unfixed_interval: 1,
            refresh_interval: 10,
        });
        assert_eq!(
            scheduler.select(1, [(1, false), (2, false)]),
            vec![(1, Priority::New), (2, Priority::New)]
        );
        assert_eq!(
            scheduler.select(2, [(1, false), (2, true), (3, false)]),
            vec![(3, Priority::New), (1, Priority::Unfixed)]
        );
        // 2 is fixed and not due for a refresh until frame 11.
        assert!(scheduler.select(3, [(2, true)]).is_empty());
        assert_eq!(scheduler.select(11, [(2, true)]), vec![(2, Priority::Refresh)]);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::New > Priority::Unfixed);
        assert!(Priority::Unfixed > Priority::Refresh);
    }
}
