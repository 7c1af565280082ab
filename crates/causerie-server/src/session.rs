//! WebSocket session manager and room fanout.
//!
//! A connection authenticates at upgrade time (invalid tokens never open a
//! socket), then walks through its entry actions: user topic, tenant
//! topic, presence, and one room per conversation the user participates
//! in. Inbound events are handled strictly in order for the session; each
//! session drains its outbound queue on a dedicated task.
//!
//! A send is published on the conversation topic AND on every other
//! participant's user topic. The doubling is deliberate redundancy against
//! partial subscription; clients deduplicate by message id.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use causerie_shared::constants::OFFLINE_GRACE_MS;
use causerie_shared::events::{
    conversation_topic, tenant_topic, user_topic, ClientEvent, ServerEvent,
};
use causerie_shared::types::{Actor, MessageView};

use crate::bus::{Bus, SessionSender};
use crate::chat::{self, SendMessageInput};
use crate::error::ApiError;
use crate::state::AppState;

static CONN_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
pub struct WsAuth {
    token: Option<String>,
    #[serde(rename = "tenantId")]
    tenant_id: Option<String>,
}

/// Upgrade handler for `/ws`. The handshake token is verified before the
/// upgrade completes, so an unauthenticated client never sees an app
/// frame.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuth>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = auth.token else {
        return ApiError::unauthorized().into_response();
    };
    let mut actor = match state.verifier.verify(&token) {
        Ok(actor) => actor,
        Err(_) => return ApiError::unauthorized().into_response(),
    };
    if let Some(tenant) = auth.tenant_id {
        actor.tenant_id = Some(tenant);
    }

    ws.on_upgrade(move |socket| handle_session(socket, actor, state))
}

async fn handle_session(socket: WebSocket, actor: Actor, state: AppState) {
    let conn_id = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
    let user_id = actor.user_id.clone();
    let tenant_id = actor.tenant_id.clone();
    let scope = Bus::scope_of(tenant_id.as_deref());

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerEvent>();
    let mut topics: HashSet<String> = HashSet::new();

    // -- entry actions, in order ---------------------------------------

    join(&state, conn_id, &tx, &mut topics, user_topic(&user_id));
    if let Some(ref tenant) = tenant_id {
        join(&state, conn_id, &tx, &mut topics, tenant_topic(tenant));
    }

    state.sessions.register(&user_id, &scope);
    state.presence.set_online(&user_id, tenant_id.as_deref());
    if let Some(ref tenant) = tenant_id {
        state.bus.publish(
            &tenant_topic(tenant),
            &ServerEvent::PresenceOnline {
                user_id: user_id.clone(),
                tenant_id: Some(tenant.clone()),
            },
            Some(conn_id),
        );
    }

    match state.db.lock().await.conversation_ids_for_user(&user_id) {
        Ok(conversation_ids) => {
            for id in conversation_ids {
                join(&state, conn_id, &tx, &mut topics, conversation_topic(id));
            }
        }
        Err(e) => {
            tracing::error!(user = %user_id, error = %e, "failed to join conversation rooms");
        }
    }

    tracing::info!(user = %user_id, conn = conn_id, rooms = topics.len(), "session connected");

    // -- outbound drain -------------------------------------------------

    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize server event");
                }
            }
        }
    });

    // -- inbound loop (strictly serial per session) ---------------------

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    handle_client_event(&state, &actor, conn_id, &tx, &mut topics, event).await;
                }
                Err(e) => {
                    tracing::warn!(user = %user_id, error = %e, "ignoring unrecognized event");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "socket error");
                break;
            }
        }
    }

    // -- teardown -------------------------------------------------------

    for topic in &topics {
        state.bus.unsubscribe(topic, conn_id);
    }
    sender_task.abort();

    let was_last_in_scope = state.sessions.unregister(&user_id, &scope);
    if was_last_in_scope {
        spawn_offline_debounce(state.clone(), user_id.clone(), tenant_id.clone());
    }
    tracing::info!(user = %user_id, conn = conn_id, "session disconnected");
}

/// Publish `presence:offline` only if the user is still gone from this
/// tenant scope after the grace window, so a quick reconnect never flaps.
fn spawn_offline_debounce(state: AppState, user_id: String, tenant_id: Option<String>) {
    let scope = Bus::scope_of(tenant_id.as_deref());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(OFFLINE_GRACE_MS)).await;
        if state.sessions.is_active(&user_id, &scope) {
            return;
        }

        state.presence.set_offline(&user_id, tenant_id.as_deref());
        if let Some(tenant) = tenant_id {
            let last_seen = state
                .presence
                .last_seen(&user_id)
                .unwrap_or_else(|| Utc::now().timestamp_millis());
            state.bus.publish(
                &tenant_topic(&tenant),
                &ServerEvent::PresenceOffline {
                    user_id,
                    tenant_id: Some(tenant.clone()),
                    last_seen,
                },
                None,
            );
        }
    });
}

fn join(
    state: &AppState,
    conn_id: u64,
    tx: &SessionSender,
    topics: &mut HashSet<String>,
    topic: String,
) {
    if topics.insert(topic.clone()) {
        state.bus.subscribe(&topic, conn_id, tx.clone());
    }
}

async fn handle_client_event(
    state: &AppState,
    actor: &Actor,
    conn_id: u64,
    tx: &SessionSender,
    topics: &mut HashSet<String>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::MessageSend {
            conversation_id,
            content,
            message_type,
            reply_to_id,
            attachment_url,
            attachment_type,
            attachment_name,
        } => {
            let input = SendMessageInput {
                conversation_id,
                content,
                kind: message_type,
                reply_to_id,
                attachment_url,
                attachment_type,
                attachment_name,
            };
            handle_send(state, actor, tx, conversation_id, input).await;
        }

        ClientEvent::TypingStart { conversation_id } => {
            handle_typing(state, actor, conn_id, conversation_id, true).await;
        }
        ClientEvent::TypingStop { conversation_id } => {
            handle_typing(state, actor, conn_id, conversation_id, false).await;
        }

        ClientEvent::MessagesRead { conversation_id } => {
            let result = {
                let db = state.db.lock().await;
                chat::mark_as_read(&db, &actor.user_id, conversation_id)
            };
            match result {
                Ok(read_at) => {
                    state.bus.publish(
                        &conversation_topic(conversation_id),
                        &ServerEvent::MessagesRead {
                            user_id: actor.user_id.clone(),
                            conversation_id,
                            read_at,
                        },
                        Some(conn_id),
                    );
                }
                Err(e) => {
                    tracing::warn!(user = %actor.user_id, error = %e, "messages:read rejected");
                }
            }
        }

        ClientEvent::ConversationJoin { conversation_id } => {
            let member = {
                let db = state.db.lock().await;
                db.is_participant(conversation_id, &actor.user_id)
            };
            match member {
                Ok(true) => {
                    join(
                        state,
                        conn_id,
                        tx,
                        topics,
                        conversation_topic(conversation_id),
                    );
                    let _ = tx.send(ServerEvent::ConversationJoined { conversation_id });
                }
                Ok(false) => {
                    let _ = tx.send(ServerEvent::ConversationError {
                        error: "not a participant of this conversation".into(),
                        conversation_id: Some(conversation_id),
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "participant check failed");
                    let _ = tx.send(ServerEvent::ConversationError {
                        error: "internal error".into(),
                        conversation_id: Some(conversation_id),
                    });
                }
            }
        }

        ClientEvent::ConversationLeave { conversation_id } => {
            let topic = conversation_topic(conversation_id);
            if topics.remove(&topic) {
                state.bus.unsubscribe(&topic, conn_id);
            }
            let _ = tx.send(ServerEvent::ConversationLeft { conversation_id });
        }

        ClientEvent::PresenceGet => {
            let _ = tx.send(ServerEvent::PresenceList {
                tenant_id: actor.tenant_id.clone(),
                online_users: state.presence.online_users(actor.tenant_id.as_deref()),
            });
        }
    }
}

async fn handle_send(
    state: &AppState,
    actor: &Actor,
    tx: &SessionSender,
    conversation_id: Uuid,
    input: SendMessageInput,
) {
    let result = {
        let mut db = state.db.lock().await;
        chat::send_message(&mut db, actor, input)
    };

    let view = match result {
        Ok(view) => view,
        Err(e) => {
            let _ = tx.send(ServerEvent::MessageError {
                error: e.to_string(),
                conversation_id: Some(conversation_id),
            });
            return;
        }
    };

    fanout_new_message(state, &view, &actor.user_id).await;

    let _ = tx.send(ServerEvent::MessageSent {
        message_id: view.id,
        conversation_id,
        timestamp: view.created_at,
    });

    // The sender is evidently done typing.
    state
        .presence
        .set_typing(conversation_id, &actor.user_id, false);
}

/// Deliver a freshly persisted message: once on the conversation topic,
/// then once per other participant on their user topic. Both the socket
/// and the REST send path fan out this way.
pub async fn fanout_new_message(state: &AppState, view: &MessageView, sender_id: &str) {
    let conversation_id = view.conversation_id;

    state.bus.publish(
        &conversation_topic(conversation_id),
        &ServerEvent::MessageNew {
            message: view.clone(),
        },
        None,
    );

    let participant_ids = {
        let db = state.db.lock().await;
        db.participant_user_ids(conversation_id)
    };
    match participant_ids {
        Ok(ids) => {
            for participant in ids.iter().filter(|p| p.as_str() != sender_id) {
                state.bus.publish(
                    &user_topic(participant),
                    &ServerEvent::MessageNew {
                        message: view.clone(),
                    },
                    None,
                );
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "user-topic fanout skipped");
        }
    }
}

/// Tell a conversation's room that someone advanced their watermark.
pub fn publish_read_receipt(
    state: &AppState,
    user_id: &str,
    conversation_id: Uuid,
    read_at: chrono::DateTime<Utc>,
) {
    state.bus.publish(
        &conversation_topic(conversation_id),
        &ServerEvent::MessagesRead {
            user_id: user_id.to_string(),
            conversation_id,
            read_at,
        },
        None,
    );
}

async fn handle_typing(
    state: &AppState,
    actor: &Actor,
    conn_id: u64,
    conversation_id: Uuid,
    is_typing: bool,
) {
    let member = {
        let db = state.db.lock().await;
        db.is_participant(conversation_id, &actor.user_id)
    };
    match member {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(user = %actor.user_id, conversation = %conversation_id, "typing event from non-participant ignored");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "participant check failed");
            return;
        }
    }

    state
        .presence
        .set_typing(conversation_id, &actor.user_id, is_typing);
    state.bus.publish(
        &conversation_topic(conversation_id),
        &ServerEvent::TypingUpdate {
            user_id: actor.user_id.clone(),
            conversation_id,
            is_typing,
        },
        Some(conn_id),
    );
}
