//! ChatMesh Backend Library
//!
//! Realtime messaging backbone: websocket connections kept alive by a
//! time-wheel heartbeat, a shared presence registry, cross-node routing and
//! a durable fanout pipeline feeding session summaries and unread counters.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod fanout;
pub mod heartbeat;
pub mod hub;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod wheel;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::api::AppState;

/// Create the application router with the given state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Client websocket
        .route("/ws", get(api::ws::ws_handler))
        // Users
        .route("/api/users/:user_id/presence", get(api::users::presence))
        .route("/api/users/:user_id/sessions", get(api::users::sessions))
        // Groups
        .route("/api/groups/:group_id/members", get(api::groups::members))
        .route(
            "/api/groups/:group_id/members/:user_id",
            put(api::groups::add_member).delete(api::groups::remove_member),
        )
        // Node-to-node
        .route("/internal/push", post(api::push::receive_push))
        .route("/internal/notices", post(api::push::create_notice))
        // Metrics (Prometheus)
        .route("/metrics", get(api::metrics::metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
