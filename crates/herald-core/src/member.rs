//! Presence channel members.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// One connection's attachment to a presence channel.
///
/// The connection ID is assigned when the member joins and never changes;
/// a member is removed, not edited, when its connection leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Stable user identifier. Several members may share it.
    pub user_id: Value,
    /// Application-defined user attributes.
    #[serde(default)]
    pub user_info: Value,
    /// Connection that produced this record.
    #[serde(rename = "socket_id")]
    pub connection_id: String,
}

/// A member as announced when it leaves: no connection ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMember {
    pub user_id: Value,
    pub user_info: Value,
}

impl Member {
    #[must_use]
    pub fn new(user_id: Value, user_info: Value, connection_id: impl Into<String>) -> Self {
        Self {
            user_id,
            user_info,
            connection_id: connection_id.into(),
        }
    }

    /// Strip the connection ID.
    #[must_use]
    pub fn into_public(self) -> PublicMember {
        PublicMember {
            user_id: self.user_id,
            user_info: self.user_info,
        }
    }
}

/// Deduplicate a membership list to one record per user.
///
/// The most recently appended record of each user wins, and the result is
/// ordered most-recent-first.
#[must_use]
pub fn presence_view(members: &[Member]) -> Vec<Member> {
    let mut seen = HashSet::new();
    members
        .iter()
        .rev()
        .filter(|member| seen.insert(member.user_id.to_string()))
        .cloned()
        .collect()
}
