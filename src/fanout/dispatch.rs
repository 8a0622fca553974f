use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{OutboundEvent, RecordHandler};
use crate::db::Database;
use crate::error::AppResult;
use crate::hub::Hub;
use crate::models::SessionType;
use crate::protocol::ServerFrame;
use crate::router::MessageRouter;
use crate::session::SessionCache;

/// Chat topic handler: records every delivery and pushes group messages to
/// members connected to this node. Single-chat messages were already routed
/// live by the sender's node.
#[derive(Clone)]
pub struct ChatDispatcher {
    hub: Hub,
    db: Database,
    sessions: SessionCache,
}

impl ChatDispatcher {
    pub fn new(hub: Hub, db: Database, sessions: SessionCache) -> Self {
        Self { hub, db, sessions }
    }
}

#[async_trait]
impl RecordHandler for ChatDispatcher {
    #[instrument(skip_all, fields(msg_id = %event.message.msg_id))]
    async fn handle(&self, event: OutboundEvent) -> AppResult<()> {
        let message = event.message;
        match message.session_type {
            SessionType::Single => {
                self.sessions.record(&message, &[message.target_id]).await?;
            }
            SessionType::Group => {
                let members = self.db.group_members(message.target_id).await?;
                self.sessions.record(&message, &members).await?;

                let envelope = ServerFrame::Message(message.clone()).encode();
                let mut pushed = 0u64;
                for &member in members.iter().filter(|&&member| member != message.from) {
                    for conn in self.hub.user_connections(member).await {
                        match conn.try_send(envelope.clone()) {
                            Ok(()) => pushed += 1,
                            Err(e) => {
                                debug!(connection_id = %conn.id(), error = %e, "group push skipped")
                            }
                        }
                    }
                }
                metrics::counter!("im_push_local_total", pushed);
            }
            SessionType::System => {
                warn!("system message on the chat topic, ignored");
            }
        }
        Ok(())
    }
}

/// Notice topic handler: records the notice for each recipient and routes it
/// to wherever they are connected.
#[derive(Clone)]
pub struct NoticeDispatcher {
    router: MessageRouter,
    sessions: SessionCache,
}

impl NoticeDispatcher {
    pub fn new(router: MessageRouter, sessions: SessionCache) -> Self {
        Self { router, sessions }
    }
}

#[async_trait]
impl RecordHandler for NoticeDispatcher {
    #[instrument(skip_all, fields(msg_id = %event.message.msg_id))]
    async fn handle(&self, event: OutboundEvent) -> AppResult<()> {
        self.sessions
            .record(&event.message, &event.recipients)
            .await?;

        let frame = ServerFrame::Notice(event.message);
        for &user in &event.recipients {
            let report = self.router.deliver(user, &frame).await;
            debug!(user_id = user, delivered = report.delivered(), "notice routed");
        }
        Ok(())
    }
}
