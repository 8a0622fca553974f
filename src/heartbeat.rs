//! Heartbeat engine
//!
//! Every live connection has exactly one pending check on a shared time wheel.
//! A firing decides between pinging, waiting a little longer, or closing the
//! connection, and schedules the next check itself. Cost per check is O(1)
//! regardless of how many connections the node holds.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionId};
use crate::protocol::{CloseReason, ServerFrame};
use crate::wheel::{self, Handler, TimeWheelHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub tick: Duration,
}

impl HeartbeatPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            timeout: config.heartbeat_timeout(),
            tick: config.wheel_tick(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Idle past the timeout; close without rescheduling.
    Timeout,
    /// Idle for a full interval; ping once and check again just after the
    /// timeout would expire. A reply resets the idle streak.
    Ping { next: Duration },
    /// Recently active; check again once a full interval of silence is possible.
    Wait { next: Duration },
}

pub fn decide(idle: Duration, policy: &HeartbeatPolicy) -> HeartbeatAction {
    if idle > policy.timeout {
        HeartbeatAction::Timeout
    } else if idle >= policy.interval {
        HeartbeatAction::Ping {
            next: (policy.timeout - idle) + policy.tick,
        }
    } else {
        HeartbeatAction::Wait {
            next: (policy.interval - idle).max(policy.tick),
        }
    }
}

#[derive(Clone)]
pub struct HeartbeatEngine {
    wheel: TimeWheelHandle<Arc<Connection>>,
    policy: HeartbeatPolicy,
}

impl HeartbeatEngine {
    /// Start the shared wheel and return the engine driving it.
    pub fn spawn(
        policy: HeartbeatPolicy,
        slots: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let handler: Handler<Arc<Connection>> = Arc::new(
            move |wheel: &TimeWheelHandle<Arc<Connection>>, key: String, conn: Arc<Connection>| {
                check(wheel, &policy, key, conn)
            },
        );
        let (wheel, task) = wheel::spawn(slots, policy.tick, shutdown, handler);
        (Self { wheel, policy }, task)
    }

    pub fn policy(&self) -> &HeartbeatPolicy {
        &self.policy
    }

    /// Schedule the first check one interval from now.
    pub fn track(&self, conn: &Arc<Connection>) {
        self.wheel
            .add(conn.id().to_string(), conn.clone(), self.policy.interval);
    }

    pub fn untrack(&self, id: ConnectionId) {
        self.wheel.remove(id.to_string());
    }
}

fn check(
    wheel: &TimeWheelHandle<Arc<Connection>>,
    policy: &HeartbeatPolicy,
    key: String,
    conn: Arc<Connection>,
) {
    if conn.is_closed() {
        return;
    }

    let idle = conn.idle();
    match decide(idle, policy) {
        HeartbeatAction::Timeout => {
            warn!(
                connection_id = %conn.id(),
                user_id = conn.user_id(),
                idle_ms = idle.as_millis() as u64,
                "heartbeat timeout"
            );
            metrics::increment_counter!("im_heartbeat_timeouts_total");
            conn.close(CloseReason::HeartbeatTimeout);
        }
        HeartbeatAction::Ping { next } => {
            // a failed ping is not fatal; the next check will catch a dead peer
            if let Err(e) = conn.push(&ServerFrame::Ping) {
                debug!(connection_id = %conn.id(), error = %e, "heartbeat ping not queued");
            }
            metrics::increment_counter!("im_heartbeat_pings_total");
            wheel.add(key, conn, next);
        }
        HeartbeatAction::Wait { next } => {
            wheel.add(key, conn, next);
        }
    }
}
