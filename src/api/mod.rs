pub mod groups;
pub mod health;
pub mod metrics;
pub mod push;
pub mod response;
pub mod users;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatService, NoticeService};
use crate::config::{Backend, Config};
use crate::connection::{Connection, Departure};
use crate::db::Database;
use crate::fanout::{
    chat_group, ChatDispatcher, FanoutConsumer, FanoutProducer, FanoutQueue, MemoryFanoutQueue,
    NoticeDispatcher, SqliteFanoutQueue, StartFrom, CHAT_TOPIC, NOTICE_GROUP, NOTICE_TOPIC,
};
use crate::heartbeat::{HeartbeatEngine, HeartbeatPolicy};
use crate::hub::Hub;
use crate::presence::{
    spawn_beat_loop, MemoryPresenceStore, PresenceRegistry, PresenceStore, SqlitePresenceStore,
};
use crate::protocol::CloseReason;
use crate::router::{HttpPushClient, MessageRouter, PushClient};
use crate::session::SessionCache;

/// Shared stores and transports a node is built on.
#[derive(Clone)]
pub struct Backends {
    pub presence: Arc<dyn PresenceStore>,
    pub queue: Arc<dyn FanoutQueue>,
    pub push: Arc<dyn PushClient>,
}

impl Backends {
    pub fn from_config(config: &Config, db: &Database) -> Result<Self> {
        let presence: Arc<dyn PresenceStore> = match config.presence_backend {
            Backend::Sqlite => Arc::new(SqlitePresenceStore::new(db.pool().clone())),
            Backend::Memory => Arc::new(MemoryPresenceStore::new()),
        };
        let queue: Arc<dyn FanoutQueue> = match config.queue_backend {
            Backend::Sqlite => Arc::new(SqliteFanoutQueue::new(db.pool().clone())),
            Backend::Memory => Arc::new(MemoryFanoutQueue::default()),
        };
        let push = Arc::new(HttpPushClient::new(Duration::from_millis(
            config.push_timeout_ms,
        ))?);
        Ok(Self {
            presence,
            queue,
            push,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub hub: Hub,
    pub presence: PresenceRegistry,
    pub heartbeat: HeartbeatEngine,
    pub router: MessageRouter,
    pub sessions: SessionCache,
    pub chat: ChatService,
    pub notices: NoticeService,
    pub departures: mpsc::UnboundedSender<Departure>,
    pub metrics: Option<PrometheusHandle>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the node and start its background loops: the heartbeat wheel,
    /// the departure reaper, the node liveness beat and one fanout consumer
    /// per topic. All of them stop when `shutdown` is cancelled.
    pub fn start(
        config: Config,
        db: Database,
        backends: Backends,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let config = Arc::new(config);
        let node_id = config.node_id.clone();
        let mut tasks = Vec::new();

        let hub = Hub::new();
        let presence = PresenceRegistry::new(
            backends.presence,
            config.presence_ttl(),
            config.node_stale_after(),
        );
        let (heartbeat, wheel_task) = HeartbeatEngine::spawn(
            HeartbeatPolicy::from_config(&config),
            config.wheel_slots,
            shutdown.clone(),
        );
        tasks.push(wheel_task);

        let router = MessageRouter::new(
            node_id.clone(),
            hub.clone(),
            presence.clone(),
            backends.push,
        );
        let sessions = SessionCache::new(db.clone());
        let producer = FanoutProducer::new(backends.queue.clone());
        let chat = ChatService::new(
            node_id.clone(),
            db.clone(),
            sessions.clone(),
            presence.clone(),
            producer.clone(),
            router.clone(),
            config.max_content_len,
            config.replay_limit,
        );
        let notices = NoticeService::new(producer, config.max_content_len);

        let (departures, departures_rx) = mpsc::unbounded_channel();
        let state = Self {
            config: config.clone(),
            db: db.clone(),
            hub: hub.clone(),
            presence: presence.clone(),
            heartbeat,
            router: router.clone(),
            sessions: sessions.clone(),
            chat,
            notices,
            departures,
            metrics: None,
            shutdown: shutdown.clone(),
        };

        tasks.push(spawn_reaper(state.clone(), departures_rx));
        tasks.push(spawn_beat_loop(
            presence,
            node_id.clone(),
            config.advertise_addr(),
            Duration::from_secs(config.node_beat_interval_secs),
            shutdown.clone(),
        ));

        let poll_interval = Duration::from_millis(config.fanout_poll_interval_ms);
        tasks.push(
            FanoutConsumer::new(
                backends.queue.clone(),
                CHAT_TOPIC,
                chat_group(&node_id),
                Arc::new(ChatDispatcher::new(hub, db, sessions.clone())),
            )
            .start_from(StartFrom::Latest)
            .poll_interval(poll_interval)
            .batch_size(config.fanout_batch_size)
            .spawn(shutdown.clone()),
        );
        tasks.push(
            FanoutConsumer::new(
                backends.queue,
                NOTICE_TOPIC,
                NOTICE_GROUP,
                Arc::new(NoticeDispatcher::new(router, sessions)),
            )
            .start_from(StartFrom::Earliest)
            .poll_interval(poll_interval)
            .batch_size(config.fanout_batch_size)
            .spawn(shutdown),
        );

        info!(node_id = %node_id, "node started");
        (state, tasks)
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Make a freshly handshaken connection reachable: Hub, presence, then
    /// the heartbeat wheel.
    pub async fn register(&self, conn: &Arc<Connection>) {
        self.hub.insert(conn.clone()).await;
        if let Err(e) = self
            .presence
            .bind(self.node_id(), conn.user_id(), conn.id())
            .await
        {
            warn!(connection_id = %conn.id(), user_id = conn.user_id(), error = %e, "presence bind failed");
        }
        self.heartbeat.track(conn);
        info!(connection_id = %conn.id(), user_id = conn.user_id(), "connection opened");
    }

    /// Disconnect cleanup, run once per connection by the reaper.
    async fn release(&self, departure: Departure) {
        self.heartbeat.untrack(departure.connection_id);
        self.hub.remove(departure.connection_id).await;
        if let Err(e) = self
            .presence
            .unbind(self.node_id(), departure.user_id, departure.connection_id)
            .await
        {
            warn!(connection_id = %departure.connection_id, error = %e, "presence unbind failed");
        }
        info!(
            connection_id = %departure.connection_id,
            user_id = departure.user_id,
            reason = departure.reason.reason(),
            "connection closed"
        );
    }

    /// Close every local connection and drop this node from the registry.
    pub async fn drain(&self) {
        let connections = self.hub.snapshot().await;
        info!(count = connections.len(), "closing connections");
        for conn in connections {
            conn.close(CloseReason::Shutdown);
        }
        if let Err(e) = self.presence.forget_node(self.node_id()).await {
            warn!(error = %e, "failed to remove node from presence registry");
        }
    }
}

fn spawn_reaper(
    state: AppState,
    mut departures: mpsc::UnboundedReceiver<Departure>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = state.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                departure = departures.recv() => match departure {
                    Some(departure) => state.release(departure).await,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }

        // cleanup requested while shutting down
        while let Ok(departure) = departures.try_recv() {
            debug!(connection_id = %departure.connection_id, "late departure");
            state.release(departure).await;
        }
    })
}
