use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use crate::TrackId;
use crate::classify::vote::{Decision, Label, Vote, VoteRecord};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Observations kept per subject
    pub window: usize,
    /// Below this confidence an observation is recorded as Unknown
    pub min_confidence: f32,
    /// Accumulated weight that fixes a label
    pub fix_weight: f32,
    /// `(min_confidence, weight)` buckets, checked from the first entry.
    pub weight_buckets: Vec<(f32, f32)>,
    /// When set, a different label reaching this weight inside the window,
    /// while outweighing the fixed label, replaces the fixed decision.
    pub relabel_weight: Option<f32>,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            window: 15,
            min_confidence: 0.5,
            fix_weight: 4.0,
            weight_buckets: vec![(0.9, 1.0), (0.75, 0.7), (0.0, 0.4)],
            relabel_weight: None,
        }
    }
}

impl StabilizerConfig {
    fn weight_for(&self, confidence: f32) -> f32 {
        self.weight_buckets
            .iter()
            .find(|(min, _)| confidence >= *min)
            .map(|&(_, w)| w)
            .unwrap_or(0.0)
    }
}

/// Voting cache turning noisy per-frame labels into one decision per
/// identity. Once fixed, a decision holds for the identity's life.
pub struct Stabilizer {
    records: HashMap<TrackId, VoteRecord>,
    frame: u64,
    config: StabilizerConfig,
}

impl Stabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            records: HashMap::new(),
            frame: 0,
            config,
        }
    }

    /// Set the frame index stamped on newly fixed decisions.
    pub fn advance(&mut self, frame: u64) {
        self.frame = frame;
    }

    /// Record one observation and return the subject's current decision.
    pub fn observe(&mut self, subject: TrackId, label: &str, confidence: f32) -> Decision {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let parsed = Label::parse(label);
        let vote = if parsed.is_unknown() || confidence < self.config.min_confidence {
            Vote {
                label: Label::Unknown,
                confidence,
                weight: 0.0,
            }
        } else {
            Vote {
                label: parsed,
                confidence,
                weight: self.config.weight_for(confidence),
            }
        };

        let frame = self.frame;
        let record = self.records.entry(subject).or_default();
        record.push(vote, self.config.window);

        if record.fixed.is_none() {
            Self::try_fix(record, &self.config, subject, frame);
        } else if let Some(threshold) = self.config.relabel_weight {
            Self::try_relabel(record, threshold, subject, frame);
        }

        Self::decision_of(record)
    }

    fn try_fix(record: &mut VoteRecord, config: &StabilizerConfig, subject: TrackId, frame: u64) {
        let window_full = record.window.len() >= config.window.max(1);
        let Some(leader) = record.tally().into_iter().next() else {
            return;
        };
        if leader.weight >= config.fix_weight || (window_full && leader.weight > 0.0) {
            debug!(subject, label = %leader.label, weight = leader.weight, window_full, "label fixed");
            record.fixed = Some(Decision {
                label: leader.label,
                confidence: leader.mean_confidence,
                is_fixed: true,
            });
            record.fixed_at_frame = Some(frame);
        }
    }

    fn try_relabel(record: &mut VoteRecord, threshold: f32, subject: TrackId, frame: u64) {
        let Some(fixed_label) = record.fixed.as_ref().map(|d| d.label.clone()) else {
            return;
        };
        let fixed_weight = record.weight_of(&fixed_label);
        let challenger = record
            .tally()
            .into_iter()
            .find(|t| t.label != fixed_label)
            .filter(|t| t.weight >= threshold && t.weight > fixed_weight);
        if let Some(t) = challenger {
            info!(subject, from = %fixed_label, to = %t.label, "label relabeled");
            record.fixed = Some(Decision {
                label: t.label,
                confidence: t.mean_confidence,
                is_fixed: true,
            });
            record.fixed_at_frame = Some(frame);
        }
    }

    fn decision_of(record: &VoteRecord) -> Decision {
        if let Some(fixed) = &record.fixed {
            return fixed.clone();
        }
        match record.tally().into_iter().next() {
            Some(leader) => Decision {
                label: leader.label,
                confidence: leader.mean_confidence,
                is_fixed: false,
            },
            None => Decision::unknown(),
        }
    }

    /// Current decision; provisional (not fixed) decisions report the leading
    /// label so far, Unknown when no confident vote exists.
    pub fn current(&self, subject: TrackId) -> Decision {
        self.records
            .get(&subject)
            .map(Self::decision_of)
            .unwrap_or_else(Decision::unknown)
    }

    pub fn is_fixed(&self, subject: TrackId) -> bool {
        self.records
            .get(&subject)
            .is_some_and(|r| r.fixed.is_some())
    }

    pub fn record(&self, subject: TrackId) -> Option<&VoteRecord> {
        self.records.get(&subject)
    }

    /// Move a subject's votes and fixed decision to a new id in one step.
    pub fn transfer(&mut self, from: TrackId, to: TrackId) {
        if let Some(record) = self.records.remove(&from) {
            self.records.insert(to, record);
        }
    }

    pub fn forget(&mut self, subject: TrackId) {
        self.records.remove(&subject);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixes_after_enough_weight() {
        let mut stabilizer = Stabilizer::new(StabilizerConfig::default());
        for _ in 0..3 {
            assert!(!stabilizer.observe(1, "customer", 0.95).is_fixed);
        }
        let decision = stabilizer.observe(1, "customer", 0.95);
        assert!(decision.is_fixed);
        assert_eq!(decision.label, Label::Known("customer".into()));
    }

    #[test]
    fn test_low_confidence_never_fixes() {
        let mut stabilizer = Stabilizer::new(StabilizerConfig::default());
        for _ in 0..30 {
            let decision = stabilizer.observe(1, "staff", 0.3);
            assert!(!decision.is_fixed);
            assert_eq!(decision.label, Label::Unknown);
        }
        assert!(!stabilizer.is_fixed(1));
        assert_eq!(stabilizer.current(1).label, Label::Unknown);
    }

    #[test]
    fn test_window_full_uses_majority() {
        let config = StabilizerConfig {
            window: 4,
            ..StabilizerConfig::default()
        };
        let mut stabilizer = Stabilizer::new(config);
        stabilizer.observe(1, "staff", 0.6);
        stabilizer.observe(1, "customer", 0.6);
        stabilizer.observe(1, "staff", 0.6);
        let decision = stabilizer.observe(1, "unknown", 0.99);
        assert!(decision.is_fixed);
        assert_eq!(decision.label.as_str(), "staff");
    }

    #[test]
    fn test_fixed_label_does_not_flicker() {
        let mut stabilizer = Stabilizer::new(StabilizerConfig::default());
        for _ in 0..4 {
            stabilizer.observe(1, "customer", 0.95);
        }
        for _ in 0..30 {
            stabilizer.observe(1, "staff", 0.95);
        }
        assert_eq!(stabilizer.current(1).label.as_str(), "customer");
    }

    #[test]
    fn test_relabel_when_enabled() {
        let config = StabilizerConfig {
            relabel_weight: Some(8.0),
            ..StabilizerConfig::default()
        };
        let mut stabilizer = Stabilizer::new(config);
        for _ in 0..4 {
            stabilizer.observe(1, "customer", 0.95);
        }
        for _ in 0..10 {
            stabilizer.observe(1, "staff", 0.95);
        }
        let decision = stabilizer.current(1);
        assert!(decision.is_fixed);
        assert_eq!(decision.label.as_str(), "staff");
    }

    #[test]
    fn test_transfer_keeps_fixed_state() {
        let mut stabilizer = Stabilizer::new(StabilizerConfig::default());
        stabilizer.advance(12);
        for _ in 0..4 {
            stabilizer.observe(1, "staff", 0.95);
        }
        stabilizer.transfer(1, 2);
        assert!(!stabilizer.is_fixed(1));
        assert!(stabilizer.is_fixed(2));
        assert_eq!(stabilizer.record(2).unwrap().fixed_at_frame, Some(12));
        // A contrary vote right after the gap does not reopen the decision.
        stabilizer.observe(2, "customer", 0.99);
        assert_eq!(stabilizer.current(2).label.as_str(), "staff");
    }
}
