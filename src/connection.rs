//! One live client connection
//!
//! A `Connection` never touches the socket itself. The websocket write loop
//! owns the sink and drains the bounded outbound queue; the read loop owns the
//! stream. Both loops watch the close signal, so flipping it is enough to
//! cancel them. The connection does not know its Hub either: a successful
//! close sends one [`Departure`] to whoever runs disconnect cleanup.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::models::UserId;
use crate::protocol::{CloseReason, Envelope, ServerFrame};

/// Opaque connection identifier, unique across the fleet with high probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub i64);

impl ConnectionId {
    pub fn generate() -> Self {
        let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
        // keep it positive
        Self((high >> 1) as i64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cleanup request emitted exactly once per connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Envelope>,
    opened_at: Instant,
    /// Milliseconds since `opened_at`; only ever moves forward.
    last_activity_ms: AtomicU64,
    closed: AtomicBool,
    close_tx: watch::Sender<Option<CloseReason>>,
    departures: mpsc::UnboundedSender<Departure>,
}

impl Connection {
    /// Create a connection and the receiving half of its outbound queue.
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        capacity: usize,
        departures: mpsc::UnboundedSender<Departure>,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, _) = watch::channel(None);
        let connection = Arc::new(Self {
            id,
            user_id,
            outbound,
            opened_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_tx,
            departures,
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let now = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::AcqRel);
    }

    pub fn last_activity(&self) -> Instant {
        self.opened_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    pub fn idle(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn push(&self, frame: &ServerFrame) -> Result<(), SendError> {
        self.try_send(frame.encode())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection. Only the first caller wins and triggers cleanup.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.close_tx.send_replace(Some(reason));
        let _ = self.departures.send(Departure {
            connection_id: self.id,
            user_id: self.user_id,
            reason,
        });
        true
    }

    /// Resolves once the connection has been closed.
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Envelope>, mpsc::UnboundedReceiver<Departure>) {
        let (departures_tx, departures_rx) = mpsc::unbounded_channel();
        let (conn, rx) = Connection::new(ConnectionId(1), 10, capacity, departures_tx);
        (conn, rx, departures_rx)
    }

    #[test]
    fn test_generated_ids_are_positive() {
        for _ in 0..1000 {
            assert!(ConnectionId::generate().0 >= 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_activity_is_monotonic() {
        let (conn, _rx, _departures) = connection(4);
        let first = conn.last_activity();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(conn.idle(), Duration::from_secs(3));

        conn.touch();
        let second = conn.last_activity();
        assert!(second >= first);
        assert_eq!(conn.idle(), Duration::ZERO);

        // a stale write can never move the timestamp back
        conn.last_activity_ms.fetch_max(5, Ordering::AcqRel);
        assert_eq!(conn.last_activity(), second);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (conn, mut rx, _departures) = connection(1);
        assert!(conn.push(&ServerFrame::Ping).is_ok());
        assert_eq!(conn.push(&ServerFrame::Pong), Err(SendError::Full));

        assert_eq!(rx.recv().await.unwrap().kind, crate::protocol::EventKind::Ping);
        assert!(conn.push(&ServerFrame::Pong).is_ok());
    }

    #[tokio::test]
    async fn test_close_runs_cleanup_once() {
        let (conn, _rx, mut departures) = connection(4);
        let mut signal = conn.close_signal();

        let racers: Vec<_> = (0..8)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let reason = if i % 2 == 0 {
                        CloseReason::HeartbeatTimeout
                    } else {
                        CloseReason::ReadError
                    };
                    conn.close(reason)
                })
            })
            .collect();

        let mut winners = 0;
        for racer in racers {
            if racer.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let departure = departures.recv().await.unwrap();
        assert_eq!(departure.connection_id, ConnectionId(1));
        assert!(departures.try_recv().is_err());

        signal.changed().await.unwrap();
        assert_eq!(*signal.borrow(), Some(departure.reason));
        assert_eq!(conn.push(&ServerFrame::Ping), Err(SendError::Closed));
    }
}
