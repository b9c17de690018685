use serde::Serialize;

use crate::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Enter,
    Exit,
}

/// Why an exit was emitted without the identity being seen outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The identity disappeared and was never re-linked.
    IdentityLost,
    /// The identity's fixed label is excluded from counting (e.g. staff).
    Excluded,
}

/// One counted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub zone_id: String,
    pub track_id: TrackId,
    pub frame: u64,
    /// Milliseconds since the Unix epoch
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ExitReason>,
}

/// Running tallies for one zone. `total` is `enter - exit` and may go
/// negative; `current` counts identities inside right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZoneCount {
    pub enter: u64,
    pub exit: u64,
    pub total: i64,
    pub current: u64,
}

impl ZoneCount {
    pub(crate) fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::Enter => self.enter += 1,
            EventKind::Exit => self.exit += 1,
        }
        self.total = self.enter as i64 - self.exit as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = ZoneEvent {
            kind: EventKind::Exit,
            zone_id: "door".into(),
            track_id: 4,
            frame: 90,
            timestamp_ms: 1_000,
            reason: Some(ExitReason::IdentityLost),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["reason"], "identity_lost");
        assert_eq!(json["timestamp"], 1_000);
        assert_eq!(serde_json::to_value(ExitReason::Excluded).unwrap(), "excluded");

        let enter = ZoneEvent {
            kind: EventKind::Enter,
            reason: None,
            ..event
        };
        let json = serde_json::to_value(&enter).unwrap();
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_total_may_go_negative() {
        let mut count = ZoneCount::default();
        count.record(EventKind::Exit);
        assert_eq!(count.total, -1);
        count.record(EventKind::Enter);
        count.record(EventKind::Enter);
        assert_eq!((count.enter, count.exit, count.total), (2, 1, 1));
    }
}
