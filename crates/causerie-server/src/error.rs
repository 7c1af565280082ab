use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use causerie_shared::ErrorKind;
use causerie_store::StoreError;

/// Failures raised by the business services (permission engine,
/// conversation service, contact management). The session surface turns
/// these into `*:error` events, the HTTP surface into [`ApiError`]s.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not a participant of this conversation")]
    NotParticipant,

    #[error("{0}")]
    PermissionDenied(String),

    #[error("a contact request must be accepted before messaging this user")]
    ContactRequestRequired { target_user_id: String },

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotParticipant | Self::PermissionDenied(_) => ErrorKind::Forbidden,
            Self::ContactRequestRequired { .. } => ErrorKind::ContactRequestRequired,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Store(StoreError::NotFound) => ErrorKind::NotFound,
            Self::Store(e) if e.is_unique_violation() => ErrorKind::Conflict,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}

/// An error ready to leave over HTTP in the response envelope.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "Missing or invalid token")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    pub fn rate_limited() -> Self {
        Self::new(ErrorKind::RateLimited, "Too many requests")
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let kind = err.kind();

        // Store internals are logged, not shown to clients.
        if let ServiceError::Store(ref store_err) = err {
            if kind == ErrorKind::Internal {
                tracing::error!(error = %store_err, "store error surfaced as INTERNAL_ERROR");
                return Self::new(kind, "Internal server error");
            }
        }

        let details = match &err {
            ServiceError::ContactRequestRequired { target_user_id } => {
                Some(json!({ "targetUserId": target_user_id }))
            }
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut error = json!({
            "code": self.kind.code(),
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }

        let body = json!({
            "success": false,
            "error": error,
        });

        (status, axum::Json(body)).into_response()
    }
}
