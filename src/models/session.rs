use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SessionType, UserId};

/// One conversation entry in a user's session list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub user_id: UserId,
    pub peer_id: i64,
    pub session_type: SessionType,
    pub last_msg_id: Option<String>,
    pub last_msg_content: Option<String>,
    pub last_msg_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    pub is_top: bool,
    pub is_mute: bool,
}
