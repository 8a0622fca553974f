//! Ordered, durable record log behind the fanout pipeline
//!
//! Records are appended per topic with a monotonically increasing sequence.
//! Consumer groups keep one committed sequence each; `commit` is a
//! compare-and-set so concurrent members of one group never move the offset
//! backwards.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::FromRow;
use tokio::sync::{Mutex, RwLock};

use super::{QueueError, QueueResult};
use crate::db::DbPool;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Record {
    pub seq: i64,
    pub topic: String,
    #[sqlx(rename = "record_key")]
    pub key: String,
    pub payload: String,
}

#[async_trait]
pub trait FanoutQueue: Send + Sync {
    /// Append a record and return its sequence.
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> QueueResult<i64>;

    /// Records of `topic` with a sequence greater than `after`, oldest first.
    async fn poll(&self, topic: &str, after: i64, limit: usize) -> QueueResult<Vec<Record>>;

    /// Sequence of the newest record of `topic`, 0 if empty.
    async fn head(&self, topic: &str) -> QueueResult<i64>;

    /// Last committed sequence of `group`, or None if it never committed.
    async fn offset(&self, group: &str) -> QueueResult<Option<i64>>;

    /// Move the offset of `group` from `expected` to `next`. False if another
    /// member moved it first.
    async fn commit(&self, group: &str, expected: i64, next: i64) -> QueueResult<bool>;

    fn backend_name(&self) -> &'static str;
}

fn normalize(topic: &str) -> QueueResult<&str> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(QueueError::InvalidTopic);
    }
    Ok(topic)
}

/// Process-local queue. Each topic keeps at most `capacity` records.
pub struct MemoryFanoutQueue {
    topics: RwLock<HashMap<String, VecDeque<Record>>>,
    offsets: Mutex<HashMap<String, i64>>,
    next_seq: Mutex<i64>,
    capacity: usize,
}

impl MemoryFanoutQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            offsets: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(1),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryFanoutQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl FanoutQueue for MemoryFanoutQueue {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> QueueResult<i64> {
        let topic = normalize(topic)?;
        let mut topics = self.topics.write().await;

        let seq = {
            let mut next = self.next_seq.lock().await;
            let seq = *next;
            *next += 1;
            seq
        };

        let records = topics.entry(topic.to_string()).or_default();
        records.push_back(Record {
            seq,
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_string(),
        });
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(seq)
    }

    async fn poll(&self, topic: &str, after: i64, limit: usize) -> QueueResult<Vec<Record>> {
        let topic = normalize(topic)?;
        let topics = self.topics.read().await;
        let Some(records) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .filter(|record| record.seq > after)
            .take(limit.max(1))
            .cloned()
            .collect())
    }

    async fn head(&self, topic: &str) -> QueueResult<i64> {
        let topic = normalize(topic)?;
        let topics = self.topics.read().await;
        Ok(topics
            .get(topic)
            .and_then(|records| records.back())
            .map(|record| record.seq)
            .unwrap_or(0))
    }

    async fn offset(&self, group: &str) -> QueueResult<Option<i64>> {
        Ok(self.offsets.lock().await.get(group).copied())
    }

    async fn commit(&self, group: &str, expected: i64, next: i64) -> QueueResult<bool> {
        let mut offsets = self.offsets.lock().await;
        let current = offsets.get(group).copied().unwrap_or(0);
        if current != expected {
            return Ok(false);
        }
        offsets.insert(group.to_string(), next);
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Queue stored in the shared SQLite database, visible to every node using it.
#[derive(Clone)]
pub struct SqliteFanoutQueue {
    pool: DbPool,
}

impl SqliteFanoutQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FanoutQueue for SqliteFanoutQueue {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> QueueResult<i64> {
        let topic = normalize(topic)?;
        let result = sqlx::query(
            "INSERT INTO fanout_records (topic, record_key, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(topic)
        .bind(key)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn poll(&self, topic: &str, after: i64, limit: usize) -> QueueResult<Vec<Record>> {
        let topic = normalize(topic)?;
        let records: Vec<Record> = sqlx::query_as(
            r#"
            SELECT seq, topic, record_key, payload
            FROM fanout_records
            WHERE topic = ? AND seq > ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(after)
        .bind(limit.max(1) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn head(&self, topic: &str) -> QueueResult<i64> {
        let topic = normalize(topic)?;
        let head: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM fanout_records WHERE topic = ?")
                .bind(topic)
                .fetch_one(&self.pool)
                .await?;
        Ok(head.unwrap_or(0))
    }

    async fn offset(&self, group: &str) -> QueueResult<Option<i64>> {
        let offset: Option<i64> =
            sqlx::query_scalar("SELECT committed_seq FROM fanout_offsets WHERE group_name = ?")
                .bind(group)
                .fetch_optional(&self.pool)
                .await?;
        Ok(offset)
    }

    async fn commit(&self, group: &str, expected: i64, next: i64) -> QueueResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO fanout_offsets (group_name, committed_seq) VALUES (?, 0)")
            .bind(group)
            .execute(&mut *tx)
            .await?;

        let moved = sqlx::query(
            "UPDATE fanout_offsets SET committed_seq = ? WHERE group_name = ? AND committed_seq = ?",
        )
        .bind(next)
        .bind(group)
        .bind(expected)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        tx.commit().await?;
        Ok(moved)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn sqlite() -> SqliteFanoutQueue {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.run_migrations().await.unwrap();
        SqliteFanoutQueue::new(db.pool().clone())
    }

    async fn exercise(queue: &dyn FanoutQueue) {
        let a = queue.publish("im.chat", "1", "a").await.unwrap();
        let other = queue.publish("im.notice", "1", "n").await.unwrap();
        let b = queue.publish("im.chat", "2", "b").await.unwrap();
        assert!(a < other && other < b);

        let all = queue.poll("im.chat", 0, 10).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.payload.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(queue.poll("im.chat", a, 10).await.unwrap().len(), 1);
        assert_eq!(queue.poll("im.chat", 0, 1).await.unwrap()[0].key, "1");
        assert_eq!(queue.head("im.chat").await.unwrap(), b);
        assert_eq!(queue.head("im.unknown").await.unwrap(), 0);

        assert_eq!(queue.offset("g").await.unwrap(), None);
        assert!(queue.commit("g", 0, a).await.unwrap());
        // a second member still holding the old offset loses
        assert!(!queue.commit("g", 0, b).await.unwrap());
        assert!(queue.commit("g", a, b).await.unwrap());
        assert_eq!(queue.offset("g").await.unwrap(), Some(b));

        assert!(matches!(
            queue.publish("  ", "k", "p").await,
            Err(QueueError::InvalidTopic)
        ));
    }

    #[tokio::test]
    async fn test_memory_queue() {
        exercise(&MemoryFanoutQueue::default()).await;
    }

    #[tokio::test]
    async fn test_sqlite_queue() {
        exercise(&sqlite().await).await;
    }

    #[tokio::test]
    async fn test_memory_queue_is_bounded() {
        let queue = MemoryFanoutQueue::new(2);
        for i in 0..5 {
            queue.publish("t", "k", &i.to_string()).await.unwrap();
        }
        let records = queue.poll("t", 0, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, "3");
    }
}
