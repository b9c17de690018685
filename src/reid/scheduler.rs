use std::collections::HashMap;

use crate::TrackId;

/// Rate limiter for embedding computation: at most one request per identity
/// every `refresh_interval` frames and at most `max_per_frame` requests per
/// frame. Identities that were never embedded go first, then the ones
/// embedded longest ago.
#[derive(Debug, Clone)]
pub struct EmbedScheduler {
    last_requested: HashMap<TrackId, u64>,
    refresh_interval: u64,
    max_per_frame: usize,
}

impl EmbedScheduler {
    pub fn new(refresh_interval: u64, max_per_frame: usize) -> Self {
        Self {
            last_requested: HashMap::new(),
            refresh_interval,
            max_per_frame,
        }
    }

    /// Pick the identities to embed on `frame` and record the requests.
    pub fn select(&mut self, frame: u64, candidates: impl IntoIterator<Item = TrackId>) -> Vec<TrackId> {
        let mut due: Vec<(Option<u64>, TrackId)> = candidates
            .into_iter()
            .filter_map(|id| {
                let last = self.last_requested.get(&id).copied();
                match last {
                    Some(at) if frame.saturating_sub(at) < self.refresh_interval => None,
                    _ => Some((last, id)),
                }
            })
            .collect();
        // `None` sorts before `Some`, so never-embedded identities lead.
        due.sort();
        due.dedup_by_key(|(_, id)| *id);

        let picked: Vec<TrackId> = due
            .into_iter()
            .take(self.max_per_frame)
            .map(|(_, id)| id)
            .collect();
        for &id in &picked {
            self.last_requested.insert(id, frame);
        }
        picked
    }

    /// Allow an identity to be requested again right away, e.g. after its
    /// embedding task timed out.
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
    fn test_per_frame_cap_and_interval() {
        let mut scheduler = EmbedScheduler::new(20, 2);
        assert_eq!(scheduler.select(1, [3, 1, 2]), vec![1, 2]);
        // 3 was never embedded; 1 and 2 are not due yet.
        assert_eq!(scheduler.select(2, [1, 2, 3]), vec![3]);
        assert!(scheduler.select(10, [1, 2, 3]).is_empty());
        assert_eq!(scheduler.select(21, [1, 2, 3]), vec![1, 2]);
    }

    #[test]
    fn test_release_makes_due_again() {
        let mut scheduler = EmbedScheduler::new(20, 4);
        assert_eq!(scheduler.select(1, [7]), vec![7]);
        scheduler.release(7);
        assert_eq!(scheduler.select(2, [7]), vec![7]);
    }
}
