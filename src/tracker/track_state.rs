use serde::{Deserialize, Serialize};

/// Track state enumeration for the tracking lifecycle.
///
/// Tentative -> Confirmed -> Deleted, or Tentative -> Deleted. No resurrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Newly created track, not yet confirmed
    #[default]
    Tentative,
    /// Track with enough consecutive hits to be surfaced
    Confirmed,
    /// Removed from tracking
    Deleted,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Tentative => "tentative",
            TrackState::Confirmed => "confirmed",
            TrackState::Deleted => "deleted",
        }
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TrackState::Confirmed)
    }
}

impl std::fmt::Display for TrackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
