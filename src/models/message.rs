use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// User and group identifiers share one numeric space.
pub type UserId = i64;

/// Kind of conversation a message belongs to
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionType {
    /// One-to-one chat, `target_id` is the peer user
    Single,
    /// Group chat, `target_id` is the group
    Group,
    /// System notice produced by the platform
    System,
}

/// A chat message or notice as pushed to clients and persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub msg_id: String,
    pub from: UserId,
    pub session_type: SessionType,
    pub target_id: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(from: UserId, session_type: SessionType, target_id: i64, content: String) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            from,
            session_type,
            target_id,
            content,
            // millisecond precision survives a round trip through storage
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    /// Conversation key from the point of view of `user`.
    ///
    /// In a single chat the peer is whoever is not `user`; in group chats and
    /// notices it is the target.
    pub fn peer_for(&self, user: UserId) -> i64 {
        match self.session_type {
            SessionType::Single if user == self.target_id => self.from,
            _ => self.target_id,
        }
    }
}
