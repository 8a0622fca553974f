//! Node-to-node endpoints

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiResponse, IntoApiResponse};
use crate::api::AppState;
use crate::models::UserId;
use crate::router::{PushRequest, PushResponse};

/// `POST /internal/push`
///
/// An unknown connection is an expected outcome and answers 200 with
/// `success: false`.
pub async fn receive_push(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Json<PushResponse> {
    Json(state.router.accept_push(&request).await)
}

#[derive(Debug, Deserialize)]
pub struct NoticeRequest {
    pub recipients: Vec<UserId>,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct NoticeAccepted {
    pub msg_id: String,
    pub recipients: usize,
}

/// `POST /internal/notices`
pub async fn create_notice(
    State(state): State<AppState>,
    Json(request): Json<NoticeRequest>,
) -> ApiResponse<NoticeAccepted> {
    let recipients = request.recipients.len();
    state
        .notices
        .notify(request.recipients, request.content)
        .await
        .map(|notice| NoticeAccepted {
            msg_id: notice.msg_id,
            recipients,
        })
        .into_api_response()
}
