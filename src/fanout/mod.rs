//! Fanout pipeline
//!
//! Accepted chat messages and notices are published once to a topic of the
//! [`FanoutQueue`]. Every node runs a consumer per topic: the chat consumer
//! belongs to a per-node group so each node sees every chat record and pushes
//! to its own Hub, while the notice consumer shares one group fleet-wide and
//! routes each notice through the [`MessageRouter`](crate::router::MessageRouter).
//!
//! Consumers poll, process, then commit. A failed batch is not committed and
//! the consumer pauses for one poll interval before retrying; processing is
//! idempotent so a retried record changes nothing twice.

mod dispatch;
mod queue;

pub use dispatch::{ChatDispatcher, NoticeDispatcher};
pub use queue::{FanoutQueue, MemoryFanoutQueue, Record, SqliteFanoutQueue};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::{ChatMessage, UserId};

pub const CHAT_TOPIC: &str = "im.chat";
pub const NOTICE_TOPIC: &str = "im.notice";
pub const NOTICE_GROUP: &str = "im.notice";

/// Consumer group of the chat topic for one node.
pub fn chat_group(node_id: &str) -> String {
    format!("{CHAT_TOPIC}@{node_id}")
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("invalid topic")]
    InvalidTopic,
    #[error("record payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A message or notice travelling through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    #[serde(flatten)]
    pub message: ChatMessage,
    /// Explicit recipients; only notices carry them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<UserId>,
}

#[derive(Clone)]
pub struct FanoutProducer {
    queue: Arc<dyn FanoutQueue>,
}

impl FanoutProducer {
    pub fn new(queue: Arc<dyn FanoutQueue>) -> Self {
        Self { queue }
    }

    pub fn backend_name(&self) -> &'static str {
        self.queue.backend_name()
    }

    pub async fn publish_chat(&self, message: &ChatMessage) -> QueueResult<i64> {
        let event = OutboundEvent {
            message: message.clone(),
            recipients: Vec::new(),
        };
        self.publish(CHAT_TOPIC, &event).await
    }

    pub async fn publish_notice(
        &self,
        message: &ChatMessage,
        recipients: Vec<UserId>,
    ) -> QueueResult<i64> {
        let event = OutboundEvent {
            message: message.clone(),
            recipients,
        };
        self.publish(NOTICE_TOPIC, &event).await
    }

    async fn publish(&self, topic: &str, event: &OutboundEvent) -> QueueResult<i64> {
        let payload = serde_json::to_string(event)?;
        let key = event.message.target_id.to_string();
        let seq = self.queue.publish(topic, &key, &payload).await?;
        debug!(topic, seq, msg_id = %event.message.msg_id, "event published");
        Ok(seq)
    }
}

#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, event: OutboundEvent) -> AppResult<()>;
}

/// Where a consumer group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    Earliest,
    Latest,
}

pub struct FanoutConsumer {
    queue: Arc<dyn FanoutQueue>,
    topic: &'static str,
    group: String,
    handler: Arc<dyn RecordHandler>,
    start: StartFrom,
    poll_interval: Duration,
    batch_size: usize,
}

impl FanoutConsumer {
    pub fn new(
        queue: Arc<dyn FanoutQueue>,
        topic: &'static str,
        group: impl Into<String>,
        handler: Arc<dyn RecordHandler>,
    ) -> Self {
        Self {
            queue,
            topic,
            group: group.into(),
            handler,
            start: StartFrom::Earliest,
            poll_interval: Duration::from_millis(50),
            batch_size: 100,
        }
    }

    pub fn start_from(mut self, start: StartFrom) -> Self {
        self.start = start;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Give a fresh group its starting offset.
    pub async fn initialize(&self) -> QueueResult<()> {
        if self.queue.offset(&self.group).await?.is_some() {
            return Ok(());
        }
        if self.start == StartFrom::Latest {
            let head = self.queue.head(self.topic).await?;
            self.queue.commit(&self.group, 0, head).await?;
        }
        Ok(())
    }

    /// Process one batch. Returns the number of records consumed.
    pub async fn run_once(&self) -> AppResult<usize> {
        let offset = self.queue.offset(&self.group).await?.unwrap_or(0);
        let records = self
            .queue
            .poll(self.topic, offset, self.batch_size)
            .await?;
        let Some(last) = records.last().map(|record| record.seq) else {
            return Ok(0);
        };

        for record in &records {
            match serde_json::from_str::<OutboundEvent>(&record.payload) {
                Ok(event) => self.handler.handle(event).await?,
                Err(e) => {
                    warn!(topic = self.topic, seq = record.seq, error = %e, "skipping undecodable record");
                }
            }
        }

        if !self.queue.commit(&self.group, offset, last).await? {
            debug!(group = %self.group, "offset moved by another member, reloading");
        }
        Ok(records.len())
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(topic = self.topic, group = %self.group, "fanout consumer started");
            let mut initialized = false;

            loop {
                if !initialized {
                    match self.initialize().await {
                        Ok(()) => initialized = true,
                        Err(e) => warn!(group = %self.group, error = %e, "consumer init failed"),
                    }
                }

                let pause = if !initialized {
                    self.poll_interval
                } else {
                    match self.run_once().await {
                        Ok(consumed) if consumed >= self.batch_size => Duration::ZERO,
                        Ok(_) => self.poll_interval,
                        Err(e) => {
                            warn!(topic = self.topic, group = %self.group, error = %e, "fanout consumer paused");
                            metrics::increment_counter!("im_fanout_errors_total");
                            self.poll_interval
                        }
                    }
                };

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            info!(topic = self.topic, group = %self.group, "fanout consumer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::SessionType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl RecordHandler for Collect {
        async fn handle(&self, event: OutboundEvent) -> AppResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::internal("store down"));
            }
            self.seen.lock().await.push(event.message.content);
            Ok(())
        }
    }

    fn message(content: &str) -> ChatMessage {
        ChatMessage::new(1, SessionType::Single, 2, content.into())
    }

    #[test]
    fn test_outbound_event_shape() {
        let event = OutboundEvent {
            message: message("hi"),
            recipients: vec![3, 4],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["content"], "hi");
        assert_eq!(json["recipients"], serde_json::json!([3, 4]));

        let back: OutboundEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried() {
        let queue: Arc<dyn FanoutQueue> = Arc::new(MemoryFanoutQueue::default());
        let producer = FanoutProducer::new(queue.clone());
        let handler = Arc::new(Collect::default());
        let consumer = FanoutConsumer::new(queue.clone(), CHAT_TOPIC, "g", handler.clone());

        producer.publish_chat(&message("one")).await.unwrap();
        producer.publish_chat(&message("two")).await.unwrap();

        handler.fail.store(true, Ordering::SeqCst);
        assert!(consumer.run_once().await.is_err());
        assert_eq!(queue.offset("g").await.unwrap(), None);

        handler.fail.store(false, Ordering::SeqCst);
        assert_eq!(consumer.run_once().await.unwrap(), 2);
        assert_eq!(consumer.run_once().await.unwrap(), 0);
        assert_eq!(*handler.seen.lock().await, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_latest_group_skips_history() {
        let queue: Arc<dyn FanoutQueue> = Arc::new(MemoryFanoutQueue::default());
        let producer = FanoutProducer::new(queue.clone());
        producer.publish_chat(&message("old")).await.unwrap();

        let handler = Arc::new(Collect::default());
        let consumer = FanoutConsumer::new(queue.clone(), CHAT_TOPIC, chat_group("n1"), handler.clone())
            .start_from(StartFrom::Latest);
        consumer.initialize().await.unwrap();

        producer.publish_chat(&message("new")).await.unwrap();
        consumer.run_once().await.unwrap();
        assert_eq!(*handler.seen.lock().await, vec!["new"]);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped() {
        let queue: Arc<dyn FanoutQueue> = Arc::new(MemoryFanoutQueue::default());
        queue.publish(NOTICE_TOPIC, "k", "not json").await.unwrap();
        let handler = Arc::new(Collect::default());
        let consumer = FanoutConsumer::new(queue.clone(), NOTICE_TOPIC, NOTICE_GROUP, handler.clone());

        assert_eq!(consumer.run_once().await.unwrap(), 1);
        assert!(handler.seen.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_consumer_drains_and_stops() {
        let queue: Arc<dyn FanoutQueue> = Arc::new(MemoryFanoutQueue::default());
        let producer = FanoutProducer::new(queue.clone());
        let handler = Arc::new(Collect::default());
        let shutdown = CancellationToken::new();
        let task = FanoutConsumer::new(queue.clone(), CHAT_TOPIC, "g", handler.clone())
            .poll_interval(Duration::from_millis(20))
            .spawn(shutdown.clone());

        producer.publish_chat(&message("live")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*handler.seen.lock().await, vec!["live"]);

        shutdown.cancel();
        task.await.unwrap();
    }
}
