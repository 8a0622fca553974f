//! Session list and unread counters
//!
//! Counters only move by accumulation: a recipient is counted when its receipt
//! row is first created and the counter is recomputed from receipts on ack.
//! Replayed fanout records and acks racing the consumer therefore converge on
//! the same value.

use std::collections::HashSet;

use tracing::{debug, instrument};

use crate::db::{Database, ReadMark};
use crate::models::{ChatMessage, Session, SessionType, UserId};

#[derive(Clone)]
pub struct SessionCache {
    db: Database,
}

impl SessionCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist `message` and count it for every recipient but the sender.
    /// Returns the recipients that were counted by this call.
    #[instrument(skip_all, fields(msg_id = %message.msg_id))]
    pub async fn record(
        &self,
        message: &ChatMessage,
        recipients: &[UserId],
    ) -> Result<Vec<UserId>, sqlx::Error> {
        self.db.persist_message(message).await?;

        let mut counted = Vec::new();
        for &user in recipients {
            if user == message.from {
                continue;
            }
            if self.db.record_delivery(message, user).await? {
                counted.push(user);
            }
        }

        if message.session_type != SessionType::System {
            self.db.merge_summary(message.from, message).await?;
        }

        debug!(counted = counted.len(), "delivery recorded");
        Ok(counted)
    }

    /// Mark messages read and reset the affected unread counters.
    pub async fn acknowledge(
        &self,
        user: UserId,
        msg_ids: &[String],
    ) -> Result<Vec<ReadMark>, sqlx::Error> {
        let marks = self.db.mark_read(user, msg_ids).await?;

        let conversations: HashSet<(i64, SessionType)> = marks
            .iter()
            .map(|mark| (mark.peer_id, mark.session_type))
            .collect();
        for (peer, session_type) in conversations {
            self.db.recount_unread(user, peer, session_type).await?;
        }

        Ok(marks)
    }

    pub async fn unread(
        &self,
        user: UserId,
        peer: i64,
        session_type: SessionType,
    ) -> Result<i64, sqlx::Error> {
        self.db.unread(user, peer, session_type).await
    }

    pub async fn list(&self, user: UserId) -> Result<Vec<Session>, sqlx::Error> {
        self.db.list_sessions(user).await
    }

    /// Unread messages of `user`, oldest first.
    pub async fn backlog(&self, user: UserId, limit: i64) -> Result<Vec<ChatMessage>, sqlx::Error> {
        self.db.backlog(user, limit).await
    }
}
