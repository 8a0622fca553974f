use async_trait::async_trait;
use sqlx::FromRow;

use super::{NodeRecord, PresenceResult, PresenceStore};
use crate::connection::ConnectionId;
use crate::db::DbPool;
use crate::models::UserId;

/// Presence store shared by every node pointing at the same database.
/// Each batch runs in one transaction.
#[derive(Clone)]
pub struct SqlitePresenceStore {
    pool: DbPool,
}

#[derive(FromRow)]
struct NodeRow {
    node_id: String,
    addr: String,
    beat_at_ms: i64,
}

impl From<NodeRow> for NodeRecord {
    fn from(row: NodeRow) -> Self {
        NodeRecord {
            node_id: row.node_id,
            addr: row.addr,
            beat_at_ms: row.beat_at_ms,
        }
    }
}

impl SqlitePresenceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceStore for SqlitePresenceStore {
    async fn bind(
        &self,
        node: &str,
        user: UserId,
        conn: ConnectionId,
        expires_at_ms: i64,
    ) -> PresenceResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO presence_members (node_id, user_id, connection_id) VALUES (?, ?, ?)",
        )
        .bind(node)
        .bind(user)
        .bind(conn.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO presence_expiry (node_id, user_id, expires_at_ms) VALUES (?, ?, ?)
            ON CONFLICT(node_id, user_id) DO UPDATE SET expires_at_ms = excluded.expires_at_ms
            "#,
        )
        .bind(node)
        .bind(user)
        .bind(expires_at_ms)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO presence_locator (user_id, connection_id, node_id) VALUES (?, ?, ?)
            ON CONFLICT(user_id, connection_id) DO UPDATE SET node_id = excluded.node_id
            "#,
        )
        .bind(user)
        .bind(conn.0)
        .bind(node)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn unbind(&self, node: &str, user: UserId, conn: ConnectionId) -> PresenceResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM presence_members WHERE node_id = ? AND user_id = ? AND connection_id = ?",
        )
        .bind(node)
        .bind(user)
        .bind(conn.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM presence_locator WHERE user_id = ? AND connection_id = ?")
            .bind(user)
            .bind(conn.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM presence_expiry
            WHERE node_id = ? AND user_id = ?
              AND NOT EXISTS (
                SELECT 1 FROM presence_members m
                WHERE m.node_id = presence_expiry.node_id AND m.user_id = presence_expiry.user_id
              )
            "#,
        )
        .bind(node)
        .bind(user)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn renew(&self, node: &str, user: UserId, expires_at_ms: i64) -> PresenceResult<()> {
        sqlx::query("UPDATE presence_expiry SET expires_at_ms = ? WHERE node_id = ? AND user_id = ?")
            .bind(expires_at_ms)
            .bind(node)
            .bind(user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn members(
        &self,
        node: &str,
        user: UserId,
        now_ms: i64,
    ) -> PresenceResult<Vec<ConnectionId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT m.connection_id
            FROM presence_members m
            JOIN presence_expiry e ON e.node_id = m.node_id AND e.user_id = m.user_id
            WHERE m.node_id = ? AND m.user_id = ? AND e.expires_at_ms > ?
            ORDER BY m.connection_id
            "#,
        )
        .bind(node)
        .bind(user)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(ConnectionId).collect())
    }

    async fn locate(&self, user: UserId) -> PresenceResult<Vec<(ConnectionId, String)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT connection_id, node_id FROM presence_locator WHERE user_id = ? ORDER BY connection_id",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(conn, node)| (ConnectionId(conn), node))
            .collect())
    }

    async fn beat(&self, node: &str, addr: &str, now_ms: i64) -> PresenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO node_liveness (node_id, addr, beat_at_ms) VALUES (?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET addr = excluded.addr, beat_at_ms = excluded.beat_at_ms
            "#,
        )
        .bind(node)
        .bind(addr)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn nodes(&self, since_ms: i64) -> PresenceResult<Vec<NodeRecord>> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            "SELECT node_id, addr, beat_at_ms FROM node_liveness WHERE beat_at_ms >= ? ORDER BY node_id",
        )
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(NodeRecord::from).collect())
    }

    async fn node(&self, node: &str) -> PresenceResult<Option<NodeRecord>> {
        let row: Option<NodeRow> =
            sqlx::query_as("SELECT node_id, addr, beat_at_ms FROM node_liveness WHERE node_id = ?")
                .bind(node)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(NodeRecord::from))
    }

    async fn forget_node(&self, node: &str) -> PresenceResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in [
            "DELETE FROM presence_members WHERE node_id = ?",
            "DELETE FROM presence_expiry WHERE node_id = ?",
            "DELETE FROM presence_locator WHERE node_id = ?",
            "DELETE FROM node_liveness WHERE node_id = ?",
        ] {
            sqlx::query(statement).bind(node).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
