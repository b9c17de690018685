/// Track lifecycle.
///
/// `Tentative → Confirmed` after `min_hits` consecutive matches;
/// `Confirmed → Stale` once unmatched for longer than the visibility cutoff;
/// `Stale → Confirmed` on a new match; `→ Deleted` after `max_age` misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackState {
    /// Newly created track, not yet confirmed
    #[default]
    Tentative,
    /// Confirmed and recently matched; reported to consumers
    Confirmed,
    /// Confirmed but not seen for a while; still associable, not reported
    Stale,
    /// Purged from tracking
    Deleted,
}

impl TrackState {
    /// Whether the track has ever been confirmed.
    pub fn is_established(self) -> bool {
        matches!(self, TrackState::Confirmed | TrackState::Stale)
    }
}
