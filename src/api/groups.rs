use axum::extract::{Path, State};
use serde::Serialize;

use crate::api::response::{ApiResponse, IntoApiResponse};
use crate::api::AppState;
use crate::error::AppError;
use crate::models::UserId;

#[derive(Debug, Serialize)]
pub struct GroupMembers {
    pub group_id: i64,
    pub members: Vec<UserId>,
}

/// `GET /api/groups/:group_id/members`
pub async fn members(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
) -> ApiResponse<GroupMembers> {
    state
        .db
        .group_members(group_id)
        .await
        .map(|members| GroupMembers { group_id, members })
        .map_err(AppError::from)
        .into_api_response()
}

/// `PUT /api/groups/:group_id/members/:user_id`
pub async fn add_member(
    State(state): State<AppState>,
    Path((group_id, user_id)): Path<(i64, UserId)>,
) -> ApiResponse<bool> {
    if group_id <= 0 || user_id <= 0 {
        return Err::<bool, _>(AppError::bad_request("ids must be positive")).into_api_response();
    }
    state
        .db
        .add_group_member(group_id, user_id)
        .await
        .map_err(AppError::from)
        .into_api_response()
}

/// `DELETE /api/groups/:group_id/members/:user_id`
pub async fn remove_member(
    State(state): State<AppState>,
    Path((group_id, user_id)): Path<(i64, UserId)>,
) -> ApiResponse<bool> {
    match state.db.remove_group_member(group_id, user_id).await {
        Ok(true) => ApiResponse::success(true),
        Ok(false) => Err::<bool, _>(AppError::not_found("group member")).into_api_response(),
        Err(e) => Err::<bool, _>(AppError::from(e)).into_api_response(),
    }
}
