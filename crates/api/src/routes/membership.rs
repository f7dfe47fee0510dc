//! Membership change ingress
//!
//! The membership authority owns room membership; when it adds or removes
//! a user it reports the change here so connected members of the room are
//! told who joined or left. The relay never mutates membership itself.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use chatrelay_shared::UserId;

use crate::{
    chat::{session, MembershipAction},
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct MembershipChangeRequest {
    pub user_id: i64,
    pub action: MembershipAction,
}

/// POST /api/v1/rooms/:room_name/membership
pub async fn notify_membership_changed(
    State(state): State<AppState>,
    Path(room_name): Path<String>,
    Json(body): Json<MembershipChangeRequest>,
) -> ApiResult<StatusCode> {
    if body.user_id < 0 {
        return Err(ApiError::BadRequest("user_id must be non-negative".to_string()));
    }

    let room = state
        .store
        .resolve_room(&room_name)
        .await?
        .ok_or(ApiError::NotFound)?;

    session::notify_membership_changed(
        &state.session_context(),
        &room,
        UserId(body.user_id),
        body.action,
    )
    .await?;

    tracing::info!(
        room = %room.name,
        user_id = body.user_id,
        action = ?body.action,
        "membership change published"
    );
    Ok(StatusCode::ACCEPTED)
}
