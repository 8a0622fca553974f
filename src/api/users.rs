use axum::extract::{Path, State};
use serde::Serialize;

use crate::api::response::{ApiResponse, IntoApiResponse};
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{Session, UserId};
use crate::presence::Route;

#[derive(Debug, Serialize)]
pub struct PresenceView {
    pub user_id: UserId,
    pub online: bool,
    pub route: Route,
}

/// `GET /api/users/:user_id/presence`
pub async fn presence(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResponse<PresenceView> {
    lookup_presence(&state, user_id).await.into_api_response()
}

async fn lookup_presence(state: &AppState, user_id: UserId) -> AppResult<PresenceView> {
    let online = state.presence.is_online(user_id).await?;
    let route = state.presence.route(user_id).await?;
    Ok(PresenceView {
        user_id,
        online,
        route,
    })
}

/// `GET /api/users/:user_id/sessions`
pub async fn sessions(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResponse<Vec<Session>> {
    state
        .sessions
        .list(user_id)
        .await
        .map_err(AppError::from)
        .into_api_response()
}
