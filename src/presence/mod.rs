//! Distributed presence registry
//!
//! Records which users own which live connections on which node, in a store
//! shared by every node of the fleet. Two structures are kept in step:
//!
//! - a per-(node, user) set of connection ids with a TTL, renewed by binds and
//!   client heartbeats,
//! - a global locator from (user, connection) to the owning node.
//!
//! Both are written in one atomic batch by the store. The registry is
//! optimistic: a locator entry that outlives its connection only causes a
//! "not found" on push, which the router treats as a miss.
//!
//! Node liveness lives here too. Every node beats its id, advertise address
//! and a millisecond timestamp every few seconds; nodes whose last beat is
//! older than the staleness window are ignored by `is_online` and the router.

mod memory;
mod sqlite;

pub use memory::MemoryPresenceStore;
pub use sqlite::SqlitePresenceStore;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ConnectionId;
use crate::models::UserId;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence store: {0}")]
    Store(#[from] sqlx::Error),
}

pub type PresenceResult<T> = Result<T, PresenceError>;

/// Liveness record of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub addr: String,
    pub beat_at_ms: i64,
}

/// Connections of one user grouped by owning node.
pub type Route = BTreeMap<String, Vec<ConnectionId>>;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add `conn` to the (node, user) set, point the locator at `node` and
    /// push the set's expiry to `expires_at_ms`, all in one batch.
    async fn bind(
        &self,
        node: &str,
        user: UserId,
        conn: ConnectionId,
        expires_at_ms: i64,
    ) -> PresenceResult<()>;

    /// Remove `conn` from the set and the locator in one batch. Empty sets are
    /// deleted.
    async fn unbind(&self, node: &str, user: UserId, conn: ConnectionId) -> PresenceResult<()>;

    async fn renew(&self, node: &str, user: UserId, expires_at_ms: i64) -> PresenceResult<()>;

    /// Unexpired members of the (node, user) set.
    async fn members(&self, node: &str, user: UserId, now_ms: i64)
        -> PresenceResult<Vec<ConnectionId>>;

    /// Every locator entry of `user` as (connection, node).
    async fn locate(&self, user: UserId) -> PresenceResult<Vec<(ConnectionId, String)>>;

    async fn beat(&self, node: &str, addr: &str, now_ms: i64) -> PresenceResult<()>;

    /// Nodes that beat at or after `since_ms`.
    async fn nodes(&self, since_ms: i64) -> PresenceResult<Vec<NodeRecord>>;

    async fn node(&self, node: &str) -> PresenceResult<Option<NodeRecord>>;

    /// Drop a node's liveness record, its sets and every locator entry
    /// pointing at it.
    async fn forget_node(&self, node: &str) -> PresenceResult<()>;

    fn backend_name(&self) -> &'static str;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    ttl: Duration,
    stale_after: Duration,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, ttl: Duration, stale_after: Duration) -> Self {
        Self {
            store,
            ttl,
            stale_after,
        }
    }

    /// Registry over a fresh in-memory store with default windows.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryPresenceStore::new()),
            Duration::from_secs(24 * 60 * 60),
            Duration::from_secs(15),
        )
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    fn expires_at(&self) -> i64 {
        now_ms() + self.ttl.as_millis() as i64
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn bind(&self, node: &str, user: UserId, conn: ConnectionId) -> PresenceResult<()> {
        self.store.bind(node, user, conn, self.expires_at()).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn unbind(&self, node: &str, user: UserId, conn: ConnectionId) -> PresenceResult<()> {
        self.store.unbind(node, user, conn).await
    }

    pub async fn renew(&self, node: &str, user: UserId) -> PresenceResult<()> {
        self.store.renew(node, user, self.expires_at()).await
    }

    /// True if any live node holds at least one connection of `user`.
    pub async fn is_online(&self, user: UserId) -> PresenceResult<bool> {
        let now = now_ms();
        for node in self.live_nodes().await? {
            if !self.store.members(&node.node_id, user, now).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Connections of `user` grouped by owning node, read from the locator.
    /// Entries left behind by nodes that stopped beating are skipped.
    pub async fn route(&self, user: UserId) -> PresenceResult<Route> {
        let live: HashSet<String> = self
            .live_nodes()
            .await?
            .into_iter()
            .map(|node| node.node_id)
            .collect();

        let mut route = Route::new();
        for (conn, node) in self.store.locate(user).await? {
            if live.contains(&node) {
                route.entry(node).or_default().push(conn);
            }
        }
        for conns in route.values_mut() {
            conns.sort();
        }
        Ok(route)
    }

    pub async fn beat(&self, node: &str, addr: &str) -> PresenceResult<()> {
        self.store.beat(node, addr, now_ms()).await
    }

    pub async fn live_nodes(&self) -> PresenceResult<Vec<NodeRecord>> {
        let since = now_ms() - self.stale_after.as_millis() as i64;
        self.store.nodes(since).await
    }

    /// Liveness record of `node` if it beat within the staleness window.
    pub async fn live_node(&self, node: &str) -> PresenceResult<Option<NodeRecord>> {
        let since = now_ms() - self.stale_after.as_millis() as i64;
        Ok(self
            .store
            .node(node)
            .await?
            .filter(|record| record.beat_at_ms >= since))
    }

    pub async fn forget_node(&self, node: &str) -> PresenceResult<()> {
        self.store.forget_node(node).await
    }
}

/// Keep this node's liveness record fresh until shutdown.
pub fn spawn_beat_loop(
    registry: PresenceRegistry,
    node_id: String,
    addr: String,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        info!(node_id = %node_id, addr = %addr, "node liveness loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match registry.beat(&node_id, &addr).await {
                        Ok(()) => debug!(node_id = %node_id, "node beat"),
                        Err(e) => warn!(node_id = %node_id, error = %e, "node beat failed"),
                    }
                }
            }
        }
    })
}
