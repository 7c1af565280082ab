use serde::{Deserialize, Serialize};

/// The wire-level error taxonomy.
///
/// Every failure surfaced to a client carries exactly one of these kinds;
/// the HTTP layer maps kinds to status codes, the socket layer folds them
/// into `*:error` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Forbidden,
    ContactRequestRequired,
    NotFound,
    Conflict,
    RateLimited,
    Internal,
    ServiceUnavailable,
}

impl ErrorKind {
    /// Stable UPPER_SNAKE wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::ContactRequestRequired => "CONTACT_REQUEST_REQUIRED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Unauthorized => 401,
            Self::Forbidden | Self::ContactRequestRequired => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimited => 429,
            Self::Internal => 500,
            Self::ServiceUnavailable => 503,
        }
    }
}
