//! Two nodes in one process sharing presence, queue and storage, driven by
//! real websocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use chatmesh_backend::{
    api::{AppState, Backends},
    config::Config,
    create_router,
    db::Database,
    fanout::{FanoutQueue, MemoryFanoutQueue},
    models::SessionType,
    presence::{MemoryPresenceStore, PresenceStore},
    router::HttpPushClient,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    state: AppState,
    port: u16,
}

struct Cluster {
    a: Node,
    b: Node,
    db: Database,
    shutdown: CancellationToken,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_node(
    node_id: &str,
    db: Database,
    presence: Arc<dyn PresenceStore>,
    queue: Arc<dyn FanoutQueue>,
    shutdown: CancellationToken,
    tune: fn(&mut Config),
) -> Node {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = Config {
        node_id: node_id.to_string(),
        port,
        advertise_addr: Some(format!("http://127.0.0.1:{port}")),
        fanout_poll_interval_ms: 10,
        ..Config::default()
    };
    tune(&mut config);
    let backends = Backends {
        presence,
        queue,
        push: Arc::new(HttpPushClient::new(Duration::from_secs(2)).unwrap()),
    };
    let (state, _tasks) = AppState::start(config, db, backends, shutdown.clone());
    state
        .presence
        .beat(node_id, &format!("http://127.0.0.1:{port}"))
        .await
        .unwrap();

    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    Node { state, port }
}

async fn cluster() -> Cluster {
    cluster_with(|_| {}).await
}

async fn cluster_with(tune: fn(&mut Config)) -> Cluster {
    let db = Database::new("sqlite::memory:").await.unwrap();
    db.run_migrations().await.unwrap();
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
    let queue: Arc<dyn FanoutQueue> = Arc::new(MemoryFanoutQueue::default());
    let shutdown = CancellationToken::new();

    let a = start_node(
        "node-a",
        db.clone(),
        presence.clone(),
        queue.clone(),
        shutdown.clone(),
        tune,
    )
    .await;
    let b = start_node("node-b", db.clone(), presence, queue, shutdown.clone(), tune).await;
    Cluster { a, b, db, shutdown }
}

async fn connect(node: &Node, user: i64) -> Client {
    let url = format!("ws://127.0.0.1:{}/ws?user_id={user}", node.port);
    let (client, _) = connect_async(url.as_str()).await.unwrap();
    let presence = &node.state.presence;
    wait_until(move || async move { presence.is_online(user).await.unwrap() }).await;
    client
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON frame, skipping server pings.
async fn next_frame(client: &mut Client) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["event"] != "ping" {
                        return frame;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no frame in time")
}

async fn send_message(client: &mut Client, session_type: &str, target: i64, content: &str) -> String {
    send(
        client,
        json!({ "type": "message", "session_type": session_type, "target_id": target, "content": content }),
    )
    .await;
    let sent = next_frame(client).await;
    assert_eq!(sent["type"], "sent", "{sent}");
    sent["msg_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_single_message_crosses_nodes_and_returns_receipt() {
    let cluster = cluster().await;
    let mut alice = connect(&cluster.a, 1).await;
    let mut bob = connect(&cluster.b, 2).await;

    let msg_id = send_message(&mut alice, "single", 2, "hello from a").await;

    let received = next_frame(&mut bob).await;
    assert_eq!(received["msg_id"], msg_id.as_str());
    assert_eq!(received["from"], 1);
    assert_eq!(received["content"], "hello from a");

    send(
        &mut bob,
        json!({ "type": "ack", "session_type": "single", "msg_ids": [msg_id] }),
    )
    .await;
    let receipt = next_frame(&mut alice).await;
    assert_eq!(receipt["type"], "read_receipt");
    assert_eq!(receipt["msg_id"], msg_id.as_str());
    assert_eq!(receipt["from"], 2);

    let db = &cluster.db;
    wait_until(move || async move { db.unread(2, 1, SessionType::Single).await.unwrap() == 0 }).await;
}

#[tokio::test]
async fn test_offline_recipient_gets_backlog_exactly_once() {
    let cluster = cluster().await;
    let mut alice = connect(&cluster.a, 1).await;

    let first = send_message(&mut alice, "single", 3, "are you there?").await;
    let second = send_message(&mut alice, "single", 3, "call me").await;
    let db = &cluster.db;
    wait_until(move || async move { db.unread(3, 1, SessionType::Single).await.unwrap() == 2 }).await;

    let mut carol = connect(&cluster.b, 3).await;
    let backlog = next_frame(&mut carol).await;
    assert_eq!(backlog["type"], "backlog");
    let ids: Vec<&str> = backlog["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["msg_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);

    send(
        &mut carol,
        json!({ "type": "ack", "session_type": "single", "msg_ids": [first, second] }),
    )
    .await;
    wait_until(move || async move { db.unread(3, 1, SessionType::Single).await.unwrap() == 0 }).await;
    carol.close(None).await.unwrap();
    let presence = &cluster.b.state.presence;
    wait_until(move || async move { !presence.is_online(3).await.unwrap() }).await;

    // nothing left to replay: the first frame after reconnecting is our pong
    let mut carol = connect(&cluster.a, 3).await;
    send(&mut carol, json!({ "type": "ping" })).await;
    assert_eq!(next_frame(&mut carol).await["type"], "pong");
}

#[tokio::test]
async fn test_group_message_reaches_members_on_both_nodes() {
    let cluster = cluster().await;
    for user in [1, 2, 3] {
        cluster.db.add_group_member(50, user).await.unwrap();
    }
    let mut alice = connect(&cluster.a, 1).await;
    let mut bob = connect(&cluster.b, 2).await;
    let mut carol = connect(&cluster.a, 3).await;

    let msg_id = send_message(&mut alice, "group", 50, "standup in 5").await;

    for member in [&mut bob, &mut carol] {
        let frame = next_frame(member).await;
        assert_eq!(frame["msg_id"], msg_id.as_str());
        assert_eq!(frame["session_type"], "group");
    }

    // the sender only ever sees its own confirmation
    send(&mut alice, json!({ "type": "ping" })).await;
    assert_eq!(next_frame(&mut alice).await["type"], "pong");
}

#[tokio::test]
async fn test_non_member_cannot_post_to_group() {
    let cluster = cluster().await;
    cluster.db.add_group_member(60, 2).await.unwrap();
    let mut mallory = connect(&cluster.a, 9).await;

    send(
        &mut mallory,
        json!({ "type": "message", "session_type": "group", "target_id": 60, "content": "hi" }),
    )
    .await;
    let frame = next_frame(&mut mallory).await;
    assert_eq!(frame["type"], "error");
}

#[tokio::test]
async fn test_unparseable_frame_closes_with_protocol_error() {
    let cluster = cluster().await;
    let mut client = connect(&cluster.a, 4).await;

    client.send(Message::Text("not json".into())).await.unwrap();

    let close = tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("socket ended without close frame: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(u16::from(close.unwrap().code), 4001);

    let presence = &cluster.a.state.presence;
    wait_until(move || async move { !presence.is_online(4).await.unwrap() }).await;
    assert!(cluster.a.state.hub.is_empty().await);
}

#[tokio::test]
async fn test_silent_client_is_closed_by_heartbeat() {
    let cluster = cluster_with(|config| {
        config.heartbeat_interval_secs = 1;
        config.heartbeat_timeout_secs = 3;
    })
    .await;
    let mut client = connect(&cluster.a, 6).await;

    // never answer the server's pings
    let mut pings = 0;
    let close = tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(Message::Text(text))) if text.contains("ping") => pings += 1,
                Some(Ok(_)) => continue,
                other => panic!("socket ended without close frame: {other:?}"),
            }
        }
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(u16::from(close.code), 4000);
    assert_eq!(close.reason, "heartbeat timeout");
    assert_eq!(pings, 1);

    let presence = &cluster.a.state.presence;
    wait_until(move || async move { !presence.is_online(6).await.unwrap() }).await;
    assert!(cluster.a.state.hub.is_empty().await);
}

#[tokio::test]
async fn test_handshake_rejects_missing_user() {
    let cluster = cluster().await;

    for query in ["", "?user_id=0", "?user_id=-1"] {
        let url = format!("ws://127.0.0.1:{}/ws{query}", cluster.a.port);
        match connect_async(url.as_str()).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
            Err(e) => panic!("unexpected error for {query:?}: {e}"),
            Ok(_) => panic!("handshake should fail for {query:?}"),
        }
    }
}

#[tokio::test]
async fn test_drain_sends_going_away() {
    let cluster = cluster().await;
    let mut client = connect(&cluster.b, 5).await;

    cluster.b.state.drain().await;

    let close = tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("socket ended without close frame: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(u16::from(close.unwrap().code), 1001);
    assert!(cluster.a.state.presence.live_node("node-b").await.unwrap().is_none());
}
