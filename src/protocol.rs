//! Client wire protocol
//!
//! Every frame is a JSON text message. Inbound frames are a closed, tagged
//! enum so dispatch is a single exhaustive `match`; outbound frames are
//! encoded once into an [`Envelope`] that can travel through a local outbound
//! queue or a cross-node push unchanged.

use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString};

use crate::models::{ChatMessage, SessionType, UserId};

/// Closed set of event kinds carried by envelopes and push RPCs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Message,
    ReadReceipt,
    Notice,
    Ping,
    Pong,
    Backlog,
    Sent,
    Error,
}

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
    Message {
        session_type: SessionType,
        target_id: i64,
        content: String,
    },
    Ack {
        session_type: SessionType,
        msg_ids: Vec<String>,
    },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Frames the server pushes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Message(ChatMessage),
    Notice(ChatMessage),
    ReadReceipt { msg_id: String, from: UserId },
    Ping,
    Pong,
    Sent { msg_id: String },
    Error { message: String },
    Backlog(Vec<ChatMessage>),
}

impl ServerFrame {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerFrame::Message(_) => EventKind::Message,
            ServerFrame::Notice(_) => EventKind::Notice,
            ServerFrame::ReadReceipt { .. } => EventKind::ReadReceipt,
            ServerFrame::Ping => EventKind::Ping,
            ServerFrame::Pong => EventKind::Pong,
            ServerFrame::Sent { .. } => EventKind::Sent,
            ServerFrame::Error { .. } => EventKind::Error,
            ServerFrame::Backlog(_) => EventKind::Backlog,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ServerFrame::Message(message) | ServerFrame::Notice(message) => json!(message),
            ServerFrame::ReadReceipt { msg_id, from } => {
                json!({ "type": "read_receipt", "msg_id": msg_id, "from": from })
            }
            ServerFrame::Ping => json!({ "event": "ping" }),
            ServerFrame::Pong => json!({ "type": "pong" }),
            ServerFrame::Sent { msg_id } => json!({ "type": "sent", "msg_id": msg_id }),
            ServerFrame::Error { message } => json!({ "type": "error", "message": message }),
            ServerFrame::Backlog(messages) => json!({ "type": "backlog", "messages": messages }),
        }
    }

    pub fn encode(&self) -> Envelope {
        Envelope {
            kind: self.kind(),
            payload: self.to_json().to_string(),
        }
    }
}

/// An encoded frame ready to be written to a socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EventKind,
    pub payload: String,
}

/// Why a connection was closed, mapped onto websocket close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadError,
    WriteError,
    ProtocolError,
    HeartbeatTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed | CloseReason::ReadError | CloseReason::WriteError => 1000,
            CloseReason::Shutdown => 1001,
            CloseReason::HeartbeatTimeout => 4000,
            CloseReason::ProtocolError => 4001,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::ReadError => "read error",
            CloseReason::WriteError => "write error",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}
