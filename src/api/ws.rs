//! Client websocket endpoint
//!
//! One upgrade spawns a write task that owns the sink and a read loop that
//! owns the stream. Both stop when the connection's close signal flips; the
//! write task then sends a close frame carrying the reason code.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::api::AppState;
use crate::connection::{Connection, ConnectionId};
use crate::error::{AppError, AppResult};
use crate::models::{ChatMessage, UserId};
use crate::protocol::{ClientFrame, CloseReason, Envelope, ServerFrame};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: Option<UserId>,
}

/// `GET /ws?user_id=<id>`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> AppResult<Response> {
    let user_id = params
        .user_id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::bad_request("user_id must be a positive integer"))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, user_id, state)))
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (conn, outbound) = Connection::new(
        ConnectionId::generate(),
        user_id,
        state.config.outbound_queue_capacity,
        state.departures.clone(),
    );
    state.register(&conn).await;

    // fetched after registration so nothing falls between replay and live traffic
    let backlog = match state.chat.backlog(user_id).await {
        Ok(backlog) => backlog,
        Err(e) => {
            warn!(user_id, error = %e, "backlog unavailable");
            Vec::new()
        }
    };

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, conn.clone(), outbound, backlog));
    read_loop(stream, &conn, &state).await;

    if let Err(e) = writer.await {
        debug!(connection_id = %conn.id(), error = %e, "write task ended abnormally");
    }
}

async fn read_loop(mut stream: SplitStream<WebSocket>, conn: &Arc<Connection>, state: &AppState) {
    let mut closed = conn.close_signal();

    while !conn.is_closed() {
        let next = tokio::select! {
            _ = closed.changed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                conn.touch();
                match ClientFrame::parse(&text) {
                    Ok(frame) => state.chat.dispatch(conn, frame).await,
                    Err(e) => {
                        debug!(connection_id = %conn.id(), error = %e, "unparseable frame");
                        conn.close(CloseReason::ProtocolError);
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                conn.close(CloseReason::ProtocolError);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => conn.touch(),
            Some(Ok(Message::Close(_))) | None => {
                conn.close(CloseReason::ClientClosed);
            }
            Some(Err(e)) => {
                debug!(connection_id = %conn.id(), error = %e, "websocket read failed");
                conn.close(CloseReason::ReadError);
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Envelope>,
    backlog: Vec<ChatMessage>,
) {
    let mut closed = conn.close_signal();

    if !backlog.is_empty() {
        let frame = ServerFrame::Backlog(backlog).encode();
        if sink.send(Message::Text(frame.payload)).await.is_err() {
            conn.close(CloseReason::WriteError);
        }
    }

    while !conn.is_closed() {
        tokio::select! {
            biased;
            _ = closed.changed() => break,
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                if sink.send(Message::Text(envelope.payload)).await.is_err() {
                    conn.close(CloseReason::WriteError);
                }
            }
        }
    }

    let reason = close_reason(&closed);
    if reason != CloseReason::ClientClosed {
        let frame = CloseFrame {
            code: reason.code(),
            reason: Cow::Borrowed(reason.reason()),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
    let _ = sink.close().await;
}

fn close_reason(signal: &watch::Receiver<Option<CloseReason>>) -> CloseReason {
    (*signal.borrow()).unwrap_or(CloseReason::ClientClosed)
}
