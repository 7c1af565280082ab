use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use causerie_shared::types::Actor;

use crate::contacts::{self, RequestAction};
use crate::error::ApiError;
use crate::permissions::PermissionEngine;
use crate::state::AppState;

use super::{created, ok};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestBody {
    to_user_id: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RespondBody {
    action: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockBody {
    user_id: String,
    reason: Option<String>,
}

pub async fn received(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    Ok(ok(contacts::list_received(&db, &actor.user_id)?))
}

pub async fn sent(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    Ok(ok(contacts::list_sent(&db, &actor.user_id)?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let mut db = state.db.lock().await;
    let view = contacts::create_request(
        &mut db,
        &state.engine,
        &actor,
        &body.to_user_id,
        body.message,
    )?;
    Ok(created(view))
}

pub async fn respond(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(body): Json<RespondBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action = RequestAction::parse(&body.action)
        .ok_or_else(|| ApiError::validation("action must be \"accept\" or \"decline\""))?;

    let db = state.db.lock().await;
    Ok(ok(contacts::respond(&db, &actor, id, action)?))
}

pub async fn block(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<BlockBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let db = state.db.lock().await;
    let view = contacts::block_user(&db, &actor, &body.user_id, body.reason)?;
    Ok(created(view))
}

pub async fn unblock(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    contacts::unblock_user(&db, &actor, &user_id)?;
    Ok(ok(json!({ "unblocked": true })))
}

pub async fn blocked(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    Ok(ok(contacts::list_blocks(&db, &actor.user_id)?))
}

pub async fn can_message(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    let recipient = PermissionEngine::resolve_recipient(&db, &user_id)
        .map_err(crate::error::ServiceError::from)?;
    let decision = state
        .engine
        .can_send_message(&db, &actor, &recipient)
        .map_err(crate::error::ServiceError::from)?;

    Ok(ok(json!({
        "canMessage": decision.allowed,
        "requiresApproval": decision.requires_approval,
        "reason": decision.reason,
    })))
}
