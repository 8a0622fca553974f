//! Client frame handling and the notice producer
//!
//! Every inbound frame goes through [`ChatService::dispatch`], one exhaustive
//! match over [`ClientFrame`]. Failures are reported to the client as `error`
//! frames; only transport problems close a connection.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::fanout::FanoutProducer;
use crate::models::{ChatMessage, SessionType, UserId};
use crate::presence::PresenceRegistry;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::router::MessageRouter;
use crate::session::SessionCache;

/// Sender id of platform notices.
pub const SYSTEM_SENDER: UserId = 0;
/// Conversation every notice is filed under.
pub const SYSTEM_CHANNEL: i64 = 0;

#[derive(Clone)]
pub struct ChatService {
    node_id: String,
    db: Database,
    sessions: SessionCache,
    presence: PresenceRegistry,
    producer: FanoutProducer,
    router: MessageRouter,
    max_content_len: usize,
    replay_limit: i64,
}

impl ChatService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: impl Into<String>,
        db: Database,
        sessions: SessionCache,
        presence: PresenceRegistry,
        producer: FanoutProducer,
        router: MessageRouter,
        max_content_len: usize,
        replay_limit: i64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            db,
            sessions,
            presence,
            producer,
            router,
            max_content_len,
            replay_limit,
        }
    }

    pub async fn dispatch(&self, conn: &Arc<Connection>, frame: ClientFrame) {
        match frame {
            ClientFrame::Ping => {
                if let Err(e) = conn.push(&ServerFrame::Pong) {
                    debug!(connection_id = %conn.id(), error = %e, "pong not queued");
                }
                self.renew(conn).await;
            }
            ClientFrame::Pong => self.renew(conn).await,
            ClientFrame::Message {
                session_type,
                target_id,
                content,
            } => {
                if let Err(e) = self.send(conn, session_type, target_id, content).await {
                    reply_error(conn, &e);
                }
            }
            ClientFrame::Ack {
                session_type,
                msg_ids,
            } => {
                if let Err(e) = self.ack(conn.user_id(), session_type, &msg_ids).await {
                    reply_error(conn, &e);
                }
            }
        }
    }

    async fn renew(&self, conn: &Arc<Connection>) {
        if let Err(e) = self.presence.renew(&self.node_id, conn.user_id()).await {
            // an unrenewed entry stays valid until its TTL runs out
            warn!(user_id = conn.user_id(), error = %e, "presence renew failed");
        }
    }

    /// Accept a message from `conn` and start its delivery.
    ///
    /// The message is published before anything is acknowledged; if the queue
    /// refuses it the sender gets an error and nothing is delivered.
    #[instrument(skip(self, conn, content), fields(from = conn.user_id()))]
    pub async fn send(
        &self,
        conn: &Arc<Connection>,
        session_type: SessionType,
        target_id: i64,
        content: String,
    ) -> AppResult<ChatMessage> {
        let from = conn.user_id();
        self.validate(from, session_type, target_id, &content).await?;

        let message = ChatMessage::new(from, session_type, target_id, content);
        self.db.persist_message(&message).await?;
        self.producer.publish_chat(&message).await?;

        if let Err(e) = conn.push(&ServerFrame::Sent {
            msg_id: message.msg_id.clone(),
        }) {
            debug!(connection_id = %conn.id(), error = %e, "sent confirmation not queued");
        }

        if session_type == SessionType::Single {
            let report = self
                .router
                .deliver(target_id, &ServerFrame::Message(message.clone()))
                .await;
            debug!(msg_id = %message.msg_id, ?report, "single message routed");
        }

        Ok(message)
    }

    async fn validate(
        &self,
        from: UserId,
        session_type: SessionType,
        target_id: i64,
        content: &str,
    ) -> AppResult<()> {
        if content.trim().is_empty() {
            return Err(AppError::bad_request("empty message"));
        }
        if content.chars().count() > self.max_content_len {
            return Err(AppError::bad_request("message too long"));
        }
        if target_id <= 0 {
            return Err(AppError::bad_request("invalid target"));
        }
        match session_type {
            SessionType::Single => Ok(()),
            SessionType::Group => {
                if self.db.group_members(target_id).await?.contains(&from) {
                    Ok(())
                } else {
                    Err(AppError::bad_request("not a member of this group"))
                }
            }
            SessionType::System => Err(AppError::bad_request("clients cannot send notices")),
        }
    }

    /// Mark messages read, then tell single-chat senders and record group
    /// read markers.
    #[instrument(skip(self, msg_ids), fields(count = msg_ids.len()))]
    pub async fn ack(
        &self,
        user: UserId,
        session_type: SessionType,
        msg_ids: &[String],
    ) -> AppResult<()> {
        let marks = self.sessions.acknowledge(user, msg_ids).await?;

        for mark in marks {
            if mark.session_type != session_type {
                debug!(msg_id = %mark.msg_id, "ack session type differs from stored message");
            }
            match mark.session_type {
                SessionType::Single => {
                    let receipt = ServerFrame::ReadReceipt {
                        msg_id: mark.msg_id,
                        from: user,
                    };
                    self.router.deliver(mark.from, &receipt).await;
                }
                SessionType::Group => {
                    self.db
                        .set_read_marker(mark.peer_id, user, &mark.msg_id)
                        .await?;
                }
                SessionType::System => {}
            }
        }
        Ok(())
    }

    /// Unread messages to replay to `user` on connect.
    pub async fn backlog(&self, user: UserId) -> AppResult<Vec<ChatMessage>> {
        Ok(self.sessions.backlog(user, self.replay_limit).await?)
    }
}

fn reply_error(conn: &Connection, error: &AppError) {
    debug!(connection_id = %conn.id(), error = %error, "client request failed");
    let message = match error {
        AppError::BadRequest(message) => message.clone(),
        AppError::Queue(_) => "message not accepted, try again".to_string(),
        _ => "internal error".to_string(),
    };
    let _ = conn.push(&ServerFrame::Error { message });
}

/// Entry point for platform notices.
#[derive(Clone)]
pub struct NoticeService {
    producer: FanoutProducer,
    max_content_len: usize,
}

impl NoticeService {
    pub fn new(producer: FanoutProducer, max_content_len: usize) -> Self {
        Self {
            producer,
            max_content_len,
        }
    }

    /// Publish one notice for `recipients`. Delivery happens on the notice
    /// consumer.
    pub async fn notify(&self, recipients: Vec<UserId>, content: String) -> AppResult<ChatMessage> {
        let recipients: Vec<UserId> = recipients
            .into_iter()
            .filter(|&user| user > 0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if recipients.is_empty() {
            return Err(AppError::bad_request("no recipients"));
        }
        if content.trim().is_empty() || content.chars().count() > self.max_content_len {
            return Err(AppError::bad_request("invalid notice content"));
        }

        let notice = ChatMessage::new(SYSTEM_SENDER, SessionType::System, SYSTEM_CHANNEL, content);
        self.producer.publish_notice(&notice, recipients.clone()).await?;
        info!(msg_id = %notice.msg_id, recipients = recipients.len(), "notice published");
        Ok(notice)
    }
}
