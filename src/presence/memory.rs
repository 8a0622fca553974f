use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{NodeRecord, PresenceResult, PresenceStore};
use crate::connection::ConnectionId;
use crate::models::UserId;

struct MemberSet {
    connections: HashSet<ConnectionId>,
    expires_at_ms: i64,
}

#[derive(Default)]
struct Inner {
    members: HashMap<(String, UserId), MemberSet>,
    locator: HashMap<UserId, HashMap<ConnectionId, String>>,
    nodes: HashMap<String, NodeRecord>,
}

/// Single-process presence store. One lock guards every structure, so each
/// batch is applied atomically.
#[derive(Default)]
pub struct MemoryPresenceStore {
    inner: RwLock<Inner>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn bind(
        &self,
        node: &str,
        user: UserId,
        conn: ConnectionId,
        expires_at_ms: i64,
    ) -> PresenceResult<()> {
        let mut inner = self.inner.write().await;
        let set = inner
            .members
            .entry((node.to_string(), user))
            .or_insert_with(|| MemberSet {
                connections: HashSet::new(),
                expires_at_ms,
            });
        set.connections.insert(conn);
        set.expires_at_ms = expires_at_ms;
        inner
            .locator
            .entry(user)
            .or_default()
            .insert(conn, node.to_string());
        Ok(())
    }

    async fn unbind(&self, node: &str, user: UserId, conn: ConnectionId) -> PresenceResult<()> {
        let mut inner = self.inner.write().await;
        let key = (node.to_string(), user);
        if let Some(set) = inner.members.get_mut(&key) {
            set.connections.remove(&conn);
            if set.connections.is_empty() {
                inner.members.remove(&key);
            }
        }
        if let Some(entries) = inner.locator.get_mut(&user) {
            entries.remove(&conn);
            if entries.is_empty() {
                inner.locator.remove(&user);
            }
        }
        Ok(())
    }

    async fn renew(&self, node: &str, user: UserId, expires_at_ms: i64) -> PresenceResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(set) = inner.members.get_mut(&(node.to_string(), user)) {
            set.expires_at_ms = expires_at_ms;
        }
        Ok(())
    }

    async fn members(
        &self,
        node: &str,
        user: UserId,
        now_ms: i64,
    ) -> PresenceResult<Vec<ConnectionId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .members
            .get(&(node.to_string(), user))
            .filter(|set| set.expires_at_ms > now_ms)
            .map(|set| set.connections.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn locate(&self, user: UserId) -> PresenceResult<Vec<(ConnectionId, String)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .locator
            .get(&user)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(conn, node)| (*conn, node.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn beat(&self, node: &str, addr: &str, now_ms: i64) -> PresenceResult<()> {
        self.inner.write().await.nodes.insert(
            node.to_string(),
            NodeRecord {
                node_id: node.to_string(),
                addr: addr.to_string(),
                beat_at_ms: now_ms,
            },
        );
        Ok(())
    }

    async fn nodes(&self, since_ms: i64) -> PresenceResult<Vec<NodeRecord>> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<_> = inner
            .nodes
            .values()
            .filter(|record| record.beat_at_ms >= since_ms)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn node(&self, node: &str) -> PresenceResult<Option<NodeRecord>> {
        Ok(self.inner.read().await.nodes.get(node).cloned())
    }

    async fn forget_node(&self, node: &str) -> PresenceResult<()> {
        let mut inner = self.inner.write().await;
        inner.nodes.remove(node);
        inner.members.retain(|(owner, _), _| owner != node);
        for entries in inner.locator.values_mut() {
            entries.retain(|_, owner| owner != node);
        }
        inner.locator.retain(|_, entries| !entries.is_empty());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_expired_set_reads_as_empty() {
        let store = MemoryPresenceStore::new();
        store.bind("n1", 1, ConnectionId(1), 1_000).await.unwrap();

        assert_eq!(store.members("n1", 1, 999).await.unwrap(), vec![ConnectionId(1)]);
        assert!(store.members("n1", 1, 1_000).await.unwrap().is_empty());

        store.renew("n1", 1, 5_000).await.unwrap();
        assert_eq!(store.members("n1", 1, 1_000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_nodes_are_filtered() {
        let store = MemoryPresenceStore::new();
        store.beat("old", "http://old", 100).await.unwrap();
        store.beat("new", "http://new", 900).await.unwrap();

        let live = store.nodes(500).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id, "new");
        assert_eq!(store.node("old").await.unwrap().unwrap().beat_at_ms, 100);
    }
}
