use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{extract::Query, Extension, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use causerie_shared::types::{Actor, ConversationKind, MessageKind};

use crate::chat::{self, CreateConversationInput, SendMessageInput};
use crate::error::ApiError;
use crate::session;
use crate::state::AppState;

use super::{created, ok, ok_with_meta, Pagination};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    #[serde(rename = "type")]
    kind: ConversationKind,
    name: Option<String>,
    description: Option<String>,
    participant_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    content: String,
    #[serde(rename = "type")]
    kind: Option<MessageKind>,
    reply_to_id: Option<Uuid>,
    attachment_url: Option<String>,
    attachment_type: Option<String>,
    attachment_name: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cursor = pagination.cursor_time()?;
    let db = state.db.lock().await;
    let (page, total_unread) = chat::get_conversations(
        &db,
        &state.presence,
        &actor.user_id,
        pagination.limit_or(20),
        cursor,
    )?;

    Ok(ok_with_meta(
        page.items,
        json!({
            "totalUnread": total_unread,
            "hasMore": page.has_more,
            "nextCursor": page.next_cursor,
        }),
    ))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(body): Json<CreateConversationBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let mut db = state.db.lock().await;
    let view = chat::create_conversation(
        &mut db,
        &state.presence,
        &state.engine,
        &actor,
        CreateConversationInput {
            kind: body.kind,
            name: body.name,
            description: body.description,
            participant_ids: body.participant_ids,
        },
    )?;
    Ok(created(view))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    let view = chat::get_conversation(&db, &state.presence, &actor.user_id, id)?;
    Ok(ok(view))
}

pub async fn participants(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    let views = chat::get_participants(&db, &state.presence, &actor.user_id, id)?;
    Ok(ok(views))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let read_at = {
        let db = state.db.lock().await;
        chat::mark_as_read(&db, &actor.user_id, id)?
    };

    session::publish_read_receipt(&state, &actor.user_id, id, read_at);
    Ok(ok(json!({ "marked": true })))
}

pub async fn messages(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(cid): Path<Uuid>,
    Query(pagination): Query<Pagination>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cursor = pagination.cursor_time()?;
    let db = state.db.lock().await;
    let page = chat::get_messages(&db, &actor.user_id, cid, pagination.limit_or(50), cursor)?;

    Ok(ok_with_meta(
        page.items,
        json!({
            "hasMore": page.has_more,
            "nextCursor": page.next_cursor,
        }),
    ))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(cid): Path<Uuid>,
    Json(body): Json<SendMessageBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let view = {
        let mut db = state.db.lock().await;
        chat::send_message(
            &mut db,
            &actor,
            SendMessageInput {
                conversation_id: cid,
                content: body.content,
                kind: body.kind,
                reply_to_id: body.reply_to_id,
                attachment_url: body.attachment_url,
                attachment_type: body.attachment_type,
                attachment_name: body.attachment_name,
            },
        )?
    };

    // REST sends reach connected sessions exactly like socket sends.
    session::fanout_new_message(&state, &view, &actor.user_id).await;

    Ok(created(view))
}

pub async fn get_message(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((cid, mid)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    let view = chat::get_message(&db, &actor.user_id, cid, mid)?;
    Ok(ok(view))
}

pub async fn unread(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    let count = chat::get_unread_count(&db, &actor.user_id)?;
    Ok(ok(json!({ "unreadCount": count })))
}
