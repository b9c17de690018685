use std::collections::VecDeque;
use std::fmt;

use serde::{Serialize, Serializer};

/// Classification label. `Unknown` is a first-class outcome and never
/// counts towards any real label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    Unknown,
    Known(String),
}

impl Label {
    pub const UNKNOWN: &'static str = "unknown";

    /// Parse a backend label; empty strings and "unknown" map to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(Self::UNKNOWN) {
            Label::Unknown
        } else {
            Label::Known(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Label::Unknown => Self::UNKNOWN,
            Label::Known(s) => s,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Label::Unknown)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One recorded observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub label: Label,
    pub confidence: f32,
    pub weight: f32,
}

/// Stabilized view of one subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub label: Label,
    pub confidence: f32,
    pub is_fixed: bool,
}

impl Decision {
    pub fn unknown() -> Self {
        Self {
            label: Label::Unknown,
            confidence: 0.0,
            is_fixed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tally {
    pub label: Label,
    pub weight: f32,
    pub votes: usize,
    pub mean_confidence: f32,
}

/// Sliding window of votes plus the fixed decision, if any.
#[derive(Debug, Clone, Default)]
pub struct VoteRecord {
    pub window: VecDeque<Vote>,
    pub fixed: Option<Decision>,
    pub fixed_at_frame: Option<u64>,
}

impl VoteRecord {
    pub(crate) fn push(&mut self, vote: Vote, capacity: usize) {
        self.window.push_back(vote);
        while self.window.len() > capacity.max(1) {
            self.window.pop_front();
        }
    }

    /// Weighted tally of known labels in the window, strongest first.
    /// Ties are broken by vote count, then label order, for reproducibility.
    pub(crate) fn tally(&self) -> Vec<Tally> {
        let mut tallies: Vec<Tally> = Vec::new();
        for vote in self.window.iter().filter(|v| !v.label.is_unknown()) {
            match tallies.iter_mut().find(|t| t.label == vote.label) {
                Some(t) => {
                    t.weight += vote.weight;
                    t.mean_confidence += vote.confidence;
                    t.votes += 1;
                }
                None => tallies.push(Tally {
                    label: vote.label.clone(),
                    weight: vote.weight,
                    votes: 1,
                    mean_confidence: vote.confidence,
                }),
            }
        }
        for t in &mut tallies {
            t.mean_confidence /= t.votes as f32;
        }
        tallies.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then(b.votes.cmp(&a.votes))
                .then(a.label.cmp(&b.label))
        });
        tallies
    }

    pub(crate) fn weight_of(&self, label: &Label) -> f32 {
        self.window
            .iter()
            .filter(|v| &v.label == label)
            .map(|v| v.weight)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(label: &str, weight: f32) -> Vote {
        Vote {
            label: Label::parse(label),
            confidence: weight,
            weight,
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(Label::parse(""), Label::Unknown);
        assert_eq!(Label::parse("Unknown"), Label::Unknown);
        assert_eq!(Label::parse(" staff "), Label::Known("staff".into()));
    }

    #[test]
    fn test_tally_ignores_unknown_and_orders() {
        let mut record = VoteRecord::default();
        for v in [vote("a", 0.4), vote("unknown", 0.0), vote("b", 1.0), vote("a", 0.4)] {
            record.push(v, 10);
        }
        let tally = record.tally();
        assert_eq!(tally.len(), 2);
        assert_eq!(tally[0].label, Label::Known("b".into()));
        assert_eq!(tally[1].votes, 2);
    }

    #[test]
    fn test_window_capacity() {
        let mut record = VoteRecord::default();
        for _ in 0..5 {
            record.push(vote("a", 1.0), 3);
        }
        assert_eq!(record.window.len(), 3);
    }
}
