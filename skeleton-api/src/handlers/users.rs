use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::debug;
use uuid::Uuid;

use skeleton_common::database::User;

use super::{error_reply, internal_error, AppState, ErrorReply};

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<User>>, ErrorReply> {
    let users = state
        .context
        .users()
        .list_active()
        .await
        .map_err(internal_error)?;

    Ok(Json(users))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ErrorReply> {
    let id = Uuid::parse_str(&id).map_err(|_| {
        debug!(id = %id, "malformed user id");
        error_reply(StatusCode::BAD_REQUEST, "invalid user id")
    })?;

    match state
        .context
        .users()
        .get_active(id)
        .await
        .map_err(internal_error)?
    {
        Some(user) => Ok(Json(user)),
        None => Err(error_reply(StatusCode::NOT_FOUND, "user not found")),
    }
}
