//! Request surface: thin adaptors over the services.
//!
//! Every response travels in the `{success, data, meta?}` /
//! `{success, error}` envelope; errors come from [`ApiError`]'s
//! `IntoResponse`. Request ids propagate via `X-Request-ID`, tenants can
//! be overridden per call with `X-Tenant-ID`.

pub mod contacts;
pub mod conversations;
pub mod health;

use std::time::Duration;

use axum::{
    extract::{Request, State, WebSocketUpgrade},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::CorsOrigins;
use crate::error::ApiError;
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;
use crate::{mesh, session};

/// Propagated (or generated) request id, available to handlers via
/// extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    let api = Router::new()
        .route(
            "/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route("/conversations/{id}", get(conversations::get_one))
        .route(
            "/conversations/{id}/participants",
            get(conversations::participants),
        )
        .route("/conversations/{id}/read", post(conversations::mark_read))
        .route(
            "/conversations/{cid}/messages",
            get(conversations::messages).post(conversations::send_message),
        )
        .route(
            "/conversations/{cid}/messages/{mid}",
            get(conversations::get_message),
        )
        .route("/messages/unread", get(conversations::unread))
        .route("/contacts/requests", get(contacts::received).post(contacts::create))
        .route("/contacts/requests/sent", get(contacts::sent))
        .route("/contacts/requests/{id}/respond", post(contacts::respond))
        .route("/contacts/block", post(contacts::block))
        .route("/contacts/block/{user_id}", delete(contacts::unblock))
        .route("/contacts/blocked", get(contacts::blocked))
        .route("/contacts/can-message/{user_id}", get(contacts::can_message))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            deadline_middleware,
        ));

    Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/bus", get(bus_peer_handler))
        .merge(health::routes())
        .nest("/api/v1", api)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    tracing::info!(addr = %addr, "Starting HTTP/WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn cors_layer(origins: &CorsOrigins) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        CorsOrigins::Any => layer.allow_origin(Any),
        CorsOrigins::List(list) => {
            let parsed: Vec<HeaderValue> = list
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect();
            layer.allow_origin(AllowOrigin::list(parsed))
        }
    }
}

/// Mesh peers attach here; see [`crate::mesh`].
async fn bus_peer_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| mesh::handle_peer(socket, bus))
        .into_response()
}

// -- middleware ---------------------------------------------------------

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::unauthorized().into_response();
    };
    let mut actor = match state.verifier.verify(token) {
        Ok(actor) => actor,
        Err(_) => return ApiError::unauthorized().into_response(),
    };

    if let Some(tenant) = req
        .headers()
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        actor.tenant_id = Some(tenant.to_string());
    }

    req.extensions_mut().insert(actor);
    next.run(req).await
}

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Requests inherit a deadline; exceeding it surfaces as
/// SERVICE_UNAVAILABLE rather than hanging the client.
pub async fn deadline_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let deadline = Duration::from_secs(state.config.request_timeout_secs);
    match tokio::time::timeout(deadline, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(request_id = %request_id, "request deadline exceeded");
            ApiError::service_unavailable("request deadline exceeded").into_response()
        }
    }
}

// -- envelope helpers ----------------------------------------------------

pub(crate) fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

pub(crate) fn ok_with_meta<T: Serialize, M: Serialize>(data: T, meta: M) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data, "meta": meta }))
}

pub(crate) fn created<T: Serialize>(data: T) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    (axum::http::StatusCode::CREATED, ok(data))
}

// -- common extractors ----------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Pagination {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

impl Pagination {
    pub fn cursor_time(&self) -> Result<Option<DateTime<Utc>>, ApiError> {
        self.cursor
            .as_deref()
            .map(|c| {
                DateTime::parse_from_rfc3339(c)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| ApiError::validation("cursor is not a valid timestamp"))
            })
            .transpose()
    }

    pub fn limit_or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_cursor_parses_rfc3339() {
        let p = Pagination {
            limit: None,
            cursor: Some(Utc::now().to_rfc3339()),
        };
        assert!(p.cursor_time().unwrap().is_some());

        let bad = Pagination {
            limit: None,
            cursor: Some("yesterday".into()),
        };
        assert!(bad.cursor_time().is_err());

        let none = Pagination {
            limit: Some(10),
            cursor: None,
        };
        assert_eq!(none.cursor_time().unwrap(), None);
        assert_eq!(none.limit_or(20), 10);
    }

    #[test]
    fn envelope_shapes() {
        let Json(body) = ok(json!({"x": 1}));
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["x"], 1);

        let Json(body) = ok_with_meta(vec![1, 2], json!({"hasMore": false}));
        assert_eq!(body["meta"]["hasMore"], false);

        let (status, _) = created(json!({}));
        assert_eq!(status, axum::http::StatusCode::CREATED);
    }
}
