//! Remote API error types
//!
//! Maps HTTP status codes to retry decisions and the errors surfaced to
//! callers once the retry budget is spent.

/// Token lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Session expired: stored credential was revoked")]
    SessionExpired,

    #[error("Not connected: no refresh credential stored")]
    NotConnected,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Token endpoint unreachable: {0}")]
    Transport(String),
}

/// Errors surfaced by the resilient fetcher and the storage client
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Upstream unavailable after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Request failed ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Non-success response that the fetcher handed back without retrying
    pub fn from_status(status: u16, body: &str) -> Self {
        ApiError::Status {
            status,
            body: body.to_string(),
        }
    }

    /// Whether the caller should show a "sign in again" prompt
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::Auth(AuthError::SessionExpired))
    }
}

/// How the fetcher treats a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx, returned as-is
    Success,
    /// 404, returned as-is; callers map it to `None`
    NotFound,
    /// 401, refresh the token and retry immediately
    Unauthorized,
    /// 429 and 5xx, retried with backoff
    Retryable,
    /// Any other status, returned as-is
    Fatal,
}

impl StatusClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => StatusClass::Success,
            401 => StatusClass::Unauthorized,
            404 => StatusClass::NotFound,
            429 => StatusClass::Retryable,
            500..=599 => StatusClass::Retryable,
            _ => StatusClass::Fatal,
        }
    }

    /// Whether this status class is retryable
    pub fn is_retryable(self) -> bool {
        matches!(self, StatusClass::Unauthorized | StatusClass::Retryable)
    }
}
