//! Per-node registry of live connections
//!
//! The Hub is the only owner of `Arc<Connection>` handles on a node. It is
//! cloned into the router, the fanout consumers and the websocket handlers.
//! The lock is held only for the map operation itself; callers get clones of
//! the handles and do any I/O after the guard is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionId};
use crate::models::UserId;

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<RwLock<HubInner>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.write().await;
        inner
            .by_user
            .entry(conn.user_id())
            .or_default()
            .insert(conn.id());
        inner.connections.insert(conn.id(), conn);
        metrics::gauge!("im_connections", inner.connections.len() as f64);
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.remove(&id)?;
        if let Some(ids) = inner.by_user.get_mut(&conn.user_id()) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_user.remove(&conn.user_id());
            }
        }
        metrics::gauge!("im_connections", inner.connections.len() as f64);
        Some(conn)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().await.connections.get(&id).cloned()
    }

    /// Local connections owned by `user`.
    pub async fn user_connections(&self, user: UserId) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(&user)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.connections.values().cloned().collect()
    }
}
