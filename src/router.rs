//! Message router and cross-node push
//!
//! `deliver` resolves where a user is connected and pushes one encoded frame
//! to each connection: straight onto the outbound queue for connections in
//! the local Hub, through a push RPC to the owning node for the rest. It is
//! best effort and at most once per connection per call. Nothing is retried
//! here; durability is the fanout pipeline's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{ConnectionId, SendError};
use crate::hub::Hub;
use crate::models::UserId;
use crate::presence::PresenceRegistry;
use crate::protocol::{Envelope, EventKind, ServerFrame};

pub const NOT_FOUND: &str = "not found";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("push payload: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("push rejected with status {0}")]
    Status(u16),
}

/// Cross-node push request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub target_connection_id: ConnectionId,
    pub event_name: EventKind,
    /// Base64 of the encoded frame.
    pub payload_bytes: String,
}

impl PushRequest {
    pub fn new(target: ConnectionId, envelope: &Envelope) -> Self {
        Self {
            target_connection_id: target,
            event_name: envelope.kind,
            payload_bytes: BASE64.encode(envelope.payload.as_bytes()),
        }
    }

    pub fn envelope(&self) -> Result<Envelope, PushError> {
        let bytes = BASE64.decode(&self.payload_bytes)?;
        Ok(Envelope {
            kind: self.event_name,
            payload: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
    pub message: String,
}

impl PushResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: "ok".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Push one frame to a connection owned by the node at `addr`.
    async fn push(&self, addr: &str, request: PushRequest) -> Result<PushResponse, PushError>;
}

/// Push client speaking JSON over HTTP to `{addr}/internal/push`.
#[derive(Clone)]
pub struct HttpPushClient {
    client: reqwest::Client,
}

impl HttpPushClient {
    pub fn new(timeout: Duration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PushClient for HttpPushClient {
    async fn push(&self, addr: &str, request: PushRequest) -> Result<PushResponse, PushError> {
        let url = format!("{}/internal/push", addr.trim_end_matches('/'));
        let response = self.client.post(url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Status(status.as_u16()));
        }
        Ok(response.json::<PushResponse>().await?)
    }
}

/// Outcome of one `deliver` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Enqueued on a connection of this node.
    pub local: usize,
    /// Accepted by another node.
    pub remote: usize,
    /// Dropped because the outbound queue was full.
    pub dropped: usize,
    /// Stale route, unknown connection or failed RPC.
    pub missed: usize,
}

impl DeliveryReport {
    pub fn delivered(&self) -> usize {
        self.local + self.remote
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    node_id: String,
    hub: Hub,
    presence: PresenceRegistry,
    push: Arc<dyn PushClient>,
}

impl MessageRouter {
    pub fn new(
        node_id: impl Into<String>,
        hub: Hub,
        presence: PresenceRegistry,
        push: Arc<dyn PushClient>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            hub,
            presence,
            push,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Push `frame` to every live connection of `user`.
    pub async fn deliver(&self, user: UserId, frame: &ServerFrame) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let route = match self.presence.route(user).await {
            Ok(route) => route,
            Err(e) => {
                warn!(user_id = user, error = %e, "route lookup failed, skipping live delivery");
                return report;
            }
        };
        if route.is_empty() {
            debug!(user_id = user, "user offline, live delivery skipped");
            return report;
        }

        let envelope = frame.encode();
        for (node, connections) in route {
            if node == self.node_id {
                for id in connections {
                    self.deliver_local(id, envelope.clone(), &mut report).await;
                }
            } else {
                self.deliver_remote(&node, connections, &envelope, &mut report)
                    .await;
            }
        }

        metrics::counter!("im_push_local_total", report.local as u64);
        metrics::counter!("im_push_remote_total", report.remote as u64);
        metrics::counter!("im_push_dropped_total", report.dropped as u64);
        metrics::counter!("im_push_missed_total", report.missed as u64);
        report
    }

    async fn deliver_local(&self, id: ConnectionId, envelope: Envelope, report: &mut DeliveryReport) {
        let Some(conn) = self.hub.get(id).await else {
            debug!(connection_id = %id, "stale local route");
            report.missed += 1;
            return;
        };
        match conn.try_send(envelope) {
            Ok(()) => report.local += 1,
            Err(SendError::Full) => {
                warn!(connection_id = %id, user_id = conn.user_id(), "outbound queue full, event dropped");
                report.dropped += 1;
            }
            Err(SendError::Closed) => report.missed += 1,
        }
    }

    async fn deliver_remote(
        &self,
        node: &str,
        connections: Vec<ConnectionId>,
        envelope: &Envelope,
        report: &mut DeliveryReport,
    ) {
        let addr = match self.presence.live_node(node).await {
            Ok(Some(record)) => record.addr,
            Ok(None) => {
                debug!(node_id = node, "route points at a dead node");
                report.missed += connections.len();
                return;
            }
            Err(e) => {
                warn!(node_id = node, error = %e, "node lookup failed");
                report.missed += connections.len();
                return;
            }
        };

        let pushes = connections.into_iter().map(|id| {
            let request = PushRequest::new(id, envelope);
            let addr = addr.as_str();
            async move { (id, self.push.push(addr, request).await) }
        });

        for (id, result) in join_all(pushes).await {
            match result {
                Ok(response) if response.success => report.remote += 1,
                Ok(response) => {
                    debug!(node_id = node, connection_id = %id, message = %response.message, "remote push refused");
                    report.missed += 1;
                }
                Err(e) => {
                    warn!(node_id = node, connection_id = %id, error = %e, "remote push failed");
                    report.missed += 1;
                }
            }
        }
    }

    /// Handle a push arriving from another node.
    pub async fn accept_push(&self, request: &PushRequest) -> PushResponse {
        let envelope = match request.envelope() {
            Ok(envelope) => envelope,
            Err(e) => return PushResponse::failed(e.to_string()),
        };
        let Some(conn) = self.hub.get(request.target_connection_id).await else {
            return PushResponse::failed(NOT_FOUND);
        };
        match conn.try_send(envelope) {
            Ok(()) => PushResponse::ok(),
            Err(SendError::Closed) => PushResponse::failed(NOT_FOUND),
            Err(e) => PushResponse::failed(e.to_string()),
        }
    }
}
