use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::TrackId;
use crate::reid::embedding::Embedding;
use crate::reid::ttl_store::TtlStore;

/// How new embeddings combine with the stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Aggregation {
    Replace,
    /// Keep up to `cap` most recent embeddings.
    Append { cap: usize },
}

/// How a stored set of embeddings is compared with a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Compare against the normalized mean.
    Mean,
    /// Best similarity among the stored embeddings.
    Best,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReidConfig {
    pub ttl_secs: f64,
    pub aggregation: Aggregation,
    pub query: QueryMode,
    /// Minimum frames between embedding requests for one identity
    pub refresh_interval: u64,
    /// Maximum embedding requests per frame
    pub max_per_frame: usize,
}

impl Default for ReidConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30.0,
            aggregation: Aggregation::Append { cap: 3 },
            query: QueryMode::Mean,
            refresh_interval: 20,
            max_per_frame: 4,
        }
    }
}

impl ReidConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl_secs.max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct ReidEntry {
    pub track_id: TrackId,
    pub embeddings: VecDeque<Embedding>,
}

impl ReidEntry {
    fn similarity(&self, query: &Embedding, mode: QueryMode) -> Option<f32> {
        match mode {
            QueryMode::Mean => Embedding::mean(&self.embeddings)?.similarity(query),
            QueryMode::Best => self
                .embeddings
                .iter()
                .filter_map(|e| e.similarity(query))
                .max_by(f32::total_cmp),
        }
    }
}

/// Weak, lookup-only appearance memory keyed by track id.
pub struct ReidCache {
    store: TtlStore<TrackId, ReidEntry>,
    config: ReidConfig,
}

impl ReidCache {
    pub fn new(config: ReidConfig) -> Self {
        Self {
            store: TtlStore::new(config.ttl()),
            config,
        }
    }

    pub fn config(&self) -> &ReidConfig {
        &self.config
    }

    /// Aggregated embedding for `track_id`, if a live entry exists.
    pub fn get(&self, track_id: TrackId) -> Option<Embedding> {
        self.get_at(track_id, Instant::now())
    }

    pub fn get_at(&self, track_id: TrackId, now: Instant) -> Option<Embedding> {
        let entry = self.store.get_at(&track_id, now)?;
        match self.config.query {
            QueryMode::Mean => Embedding::mean(&entry.embeddings),
            QueryMode::Best => entry.embeddings.back().cloned(),
        }
    }

    pub fn set(&mut self, track_id: TrackId, embedding: Embedding) {
        self.set_at(track_id, embedding, self.config.ttl(), Instant::now());
    }

    pub fn set_with_ttl(&mut self, track_id: TrackId, embedding: Embedding, ttl: Duration) {
        self.set_at(track_id, embedding, ttl, Instant::now());
    }

    /// Store an embedding and restart the entry's TTL.
    pub fn set_at(&mut self, track_id: TrackId, embedding: Embedding, ttl: Duration, now: Instant) {
        let aggregation = self.config.aggregation;
        if let Some(entry) = self.store.get_mut_at(&track_id, ttl, now) {
            match aggregation {
                Aggregation::Replace => {
                    entry.embeddings.clear();
                    entry.embeddings.push_back(embedding);
                }
                Aggregation::Append { cap } => {
                    entry.embeddings.push_back(embedding);
                    while entry.embeddings.len() > cap.max(1) {
                        entry.embeddings.pop_front();
                    }
                }
            }
            return;
        }

        let entry = ReidEntry {
            track_id,
            embeddings: VecDeque::from([embedding]),
        };
        self.store.insert_at(track_id, entry, ttl, now);
    }

    /// Best-matching candidate for `query`. Candidates without a live entry
    /// are skipped; ties go to the lowest track id.
    pub fn best_match(&self, query: &Embedding, candidates: &[TrackId]) -> Option<(TrackId, f32)> {
        self.best_match_at(query, candidates, Instant::now())
    }

    pub fn best_match_at(
        &self,
        query: &Embedding,
        candidates: &[TrackId],
        now: Instant,
    ) -> Option<(TrackId, f32)> {
        let mut best: Option<(TrackId, f32)> = None;
        for &id in candidates {
            let Some(entry) = self.store.get_at(&id, now) else {
                continue;
            };
            let Some(similarity) = entry.similarity(query, self.config.query) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((best_id, best_sim)) => {
                    similarity > best_sim || (similarity == best_sim && id < best_id)
                }
            };
            if better {
                best = Some((id, similarity));
            }
        }
        best
    }

    /// Move an entry to a new id, keeping its remaining lifetime semantics
    /// (the move counts as a refresh).
    pub fn transfer(&mut self, from: TrackId, to: TrackId) {
        if let Some(mut entry) = self.store.remove(&from) {
            entry.track_id = to;
            self.store.insert(to, entry);
        }
    }

    pub fn remove(&mut self, track_id: TrackId) {
        self.store.remove(&track_id);
    }

    pub fn purge_expired(&mut self) -> usize {
        self.store.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn config(aggregation: Aggregation, query: QueryMode) -> ReidConfig {
        ReidConfig {
            ttl_secs: 10.0,
            aggregation,
            query,
            ..ReidConfig::default()
        }
    }

    #[test]
    fn test_expired_entry_is_invisible() {
        let cache_cfg = config(Aggregation::Replace, QueryMode::Mean);
        let ttl = cache_cfg.ttl();
        let mut cache = ReidCache::new(cache_cfg);
        let start = Instant::now();
        cache.set_at(1, emb(&[1.0, 0.0]), ttl, start);

        let later = start + Duration::from_secs(11);
        assert!(cache.get_at(1, later).is_none());
        assert!(cache.best_match_at(&emb(&[1.0, 0.0]), &[1], later).is_none());
    }

    #[test]
    fn test_append_caps_and_averages() {
        let mut cache = ReidCache::new(config(Aggregation::Append { cap: 2 }, QueryMode::Mean));
        cache.set(1, emb(&[1.0, 0.0, 0.0]));
        cache.set(1, emb(&[0.0, 1.0, 0.0]));
        cache.set(1, emb(&[0.0, 0.0, 1.0]));

        // The first embedding was evicted.
        let mean = cache.get(1).unwrap();
        assert!(mean.similarity(&emb(&[1.0, 0.0, 0.0])).unwrap().abs() < 1e-6);
        assert!(mean.similarity(&emb(&[0.0, 1.0, 1.0])).unwrap() > 0.99);
    }

    #[test]
    fn test_best_query_mode() {
        let mut cache = ReidCache::new(config(Aggregation::Append { cap: 3 }, QueryMode::Best));
        cache.set(1, emb(&[1.0, 0.0]));
        cache.set(1, emb(&[0.0, 1.0]));
        let (id, sim) = cache.best_match(&emb(&[1.0, 0.0]), &[1]).unwrap();
        assert_eq!(id, 1);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_best_match_tie_goes_to_lowest_id() {
        let mut cache = ReidCache::new(ReidConfig::default());
        cache.set(9, emb(&[1.0, 0.0]));
        cache.set(4, emb(&[1.0, 0.0]));
        cache.set(2, emb(&[0.0, 1.0]));
        let (id, _) = cache.best_match(&emb(&[1.0, 0.0]), &[9, 4, 2, 77]).unwrap();
        assert_eq!(id, 4);
    }

    #[test]
    fn test_transfer() {
        let mut cache = ReidCache::new(ReidConfig::default());
        cache.set(1, emb(&[1.0, 0.0]));
        cache.transfer(1, 5);
        assert!(cache.get(1).is_none());
        assert!(cache.get(5).is_some());
    }
}
