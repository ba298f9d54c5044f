//! Who may join which room.

use serde::{Deserialize, Serialize};
use tutorchat_proto::ids::{RoomId, UserId};

/// Policy consulted when a connection asks to join a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomAccess {
    /// Any connection may join any room.
    #[default]
    Open,
    /// Only a registered participant named in the room key may join.
    Participants,
}

impl RoomAccess {
    /// Returns `true` if a connection registered as `user` may join `room`.
    #[must_use]
    pub fn permits(self, user: Option<&UserId>, room: &RoomId) -> bool {
        match self {
            Self::Open => true,
            Self::Participants => user.is_some_and(|u| room.has_participant(u)),
        }
    }
}

impl std::str::FromStr for RoomAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "participants" => Ok(Self::Participants),
            other => Err(format!(
                "unknown room access policy {other:?} (expected \"open\" or \"participants\")"
            )),
        }
    }
}

impl std::fmt::Display for RoomAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Participants => "participants",
        })
    }
}
