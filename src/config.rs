use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

/// Which backend holds shared presence state / the durable fanout queue.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Base URL other nodes use to reach this one for cross-node pushes.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_wheel_tick_ms")]
    pub wheel_tick_ms: u64,

    #[serde(default = "default_wheel_slots")]
    pub wheel_slots: usize,

    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,

    #[serde(default = "default_node_beat_interval_secs")]
    pub node_beat_interval_secs: u64,

    #[serde(default = "default_node_stale_after_secs")]
    pub node_stale_after_secs: u64,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    #[serde(default = "default_fanout_poll_interval_ms")]
    pub fanout_poll_interval_ms: u64,

    #[serde(default = "default_fanout_batch_size")]
    pub fanout_batch_size: usize,

    #[serde(default = "default_replay_limit")]
    pub replay_limit: i64,

    #[serde(default = "default_max_content_len")]
    pub max_content_len: usize,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_backend")]
    pub presence_backend: Backend,

    #[serde(default = "default_backend")]
    pub queue_backend: Backend,
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite://chatmesh.db".to_string()
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_wheel_tick_ms() -> u64 {
    100
}

fn default_wheel_slots() -> usize {
    600
}

fn default_presence_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_node_beat_interval_secs() -> u64 {
    5
}

fn default_node_stale_after_secs() -> u64 {
    15
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_push_timeout_ms() -> u64 {
    2000
}

fn default_fanout_poll_interval_ms() -> u64 {
    200
}

fn default_fanout_batch_size() -> usize {
    100
}

fn default_replay_limit() -> i64 {
    200
}

fn default_max_content_len() -> usize {
    4096
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_backend() -> Backend {
    Backend::Sqlite
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let settings: Config = config
            .try_deserialize()
            .unwrap_or_else(|_| Config::default());

        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the heartbeat engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            bail!("HEARTBEAT_INTERVAL_SECS must be greater than zero");
        }
        // timeout must sit between 2.5x and 3.5x the check interval
        let interval = self.heartbeat_interval_secs * 10;
        let timeout = self.heartbeat_timeout_secs * 10;
        if timeout < interval * 25 / 10 || timeout > interval * 35 / 10 {
            bail!(
                "HEARTBEAT_TIMEOUT_SECS ({}) must be 2.5-3.5x HEARTBEAT_INTERVAL_SECS ({})",
                self.heartbeat_timeout_secs,
                self.heartbeat_interval_secs
            );
        }
        if self.wheel_tick_ms == 0 || self.wheel_slots == 0 {
            bail!("time wheel tick and slot count must be non-zero");
        }
        if self.outbound_queue_capacity == 0 || self.fanout_batch_size == 0 {
            bail!("queue capacities must be non-zero");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn wheel_tick(&self) -> Duration {
        Duration::from_millis(self.wheel_tick_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn node_stale_after(&self) -> Duration {
        Duration::from_secs(self.node_stale_after_secs)
    }

    /// Address advertised in the node liveness record.
    pub fn advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_url: default_database_url(),
            node_id: default_node_id(),
            advertise_addr: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            wheel_tick_ms: default_wheel_tick_ms(),
            wheel_slots: default_wheel_slots(),
            presence_ttl_secs: default_presence_ttl_secs(),
            node_beat_interval_secs: default_node_beat_interval_secs(),
            node_stale_after_secs: default_node_stale_after_secs(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            push_timeout_ms: default_push_timeout_ms(),
            fanout_poll_interval_ms: default_fanout_poll_interval_ms(),
            fanout_batch_size: default_fanout_batch_size(),
            replay_limit: default_replay_limit(),
            max_content_len: default_max_content_len(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            presence_backend: default_backend(),
            queue_backend: default_backend(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url, "sqlite://chatmesh.db");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.presence_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.presence_backend, Backend::Sqlite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_ratio_is_enforced() {
        let mut config = Config {
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 20,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.heartbeat_timeout_secs = 25;
        assert!(config.validate().is_ok());

        config.heartbeat_timeout_secs = 35;
        assert!(config.validate().is_ok());

        config.heartbeat_timeout_secs = 36;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_advertise_addr_falls_back_to_port() {
        let config = Config {
            port: 9001,
            ..Config::default()
        };
        assert_eq!(config.advertise_addr(), "http://127.0.0.1:9001");
    }
}
