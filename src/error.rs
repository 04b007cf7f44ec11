//! Error taxonomy for Goblet, mirrored onto HTTP status codes in `http::routes`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Outcome of a single upstream contact attempt, also stored in mirror
/// metadata so a later request can decide whether stale-fallback applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamOutcome {
    Ok,
    Network,
    Timeout,
    Auth,
    Protocol,
    Status(u16),
}

impl UpstreamOutcome {
    /// Label value for `goblet_upstream_errors_total{kind}`. `Ok` has no
    /// label since it is never recorded as an error.
    pub fn kind_label(&self) -> &'static str {
        match self {
            UpstreamOutcome::Ok => "ok",
            UpstreamOutcome::Network => "network",
            UpstreamOutcome::Timeout => "timeout",
            UpstreamOutcome::Auth => "auth",
            UpstreamOutcome::Protocol => "protocol",
            UpstreamOutcome::Status(_) => "status",
        }
    }
}

impl std::fmt::Display for UpstreamOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamOutcome::Ok => write!(f, "ok"),
            UpstreamOutcome::Network => write!(f, "network"),
            UpstreamOutcome::Timeout => write!(f, "timeout"),
            UpstreamOutcome::Auth => write!(f, "auth"),
            UpstreamOutcome::Protocol => write!(f, "protocol"),
            UpstreamOutcome::Status(code) => write!(f, "status({code})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GobletError {
    #[error("malformed request: {0}")]
    Protocol(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("upstream unreachable: {0}")]
    UpstreamNetwork(String),

    #[error("timed out before the first response byte: {0}")]
    Timeout(String),

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("upstream spoke an invalid protocol: {0}")]
    UpstreamProtocol(String),

    #[error("cache corruption detected for {repository}: {detail}")]
    CacheCorruption { repository: String, detail: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Clone for GobletError {
    fn clone(&self) -> Self {
        match self {
            GobletError::Protocol(s) => GobletError::Protocol(s.clone()),
            GobletError::Unauthorized => GobletError::Unauthorized,
            GobletError::Forbidden(s) => GobletError::Forbidden(s.clone()),
            GobletError::UpstreamNetwork(s) => GobletError::UpstreamNetwork(s.clone()),
            GobletError::Timeout(s) => GobletError::Timeout(s.clone()),
            GobletError::UpstreamStatus(code) => GobletError::UpstreamStatus(*code),
            GobletError::UpstreamProtocol(s) => GobletError::UpstreamProtocol(s.clone()),
            GobletError::CacheCorruption { repository, detail } => GobletError::CacheCorruption {
                repository: repository.clone(),
                detail: detail.clone(),
            },
            GobletError::ResourceExhausted(s) => GobletError::ResourceExhausted(s.clone()),
            GobletError::Cancelled => GobletError::Cancelled,
            GobletError::NotFound(s) => GobletError::NotFound(s.clone()),
            GobletError::Internal(s) => GobletError::Internal(s.clone()),
            GobletError::Io(e) => GobletError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl GobletError {
    pub fn upstream_outcome(&self) -> Option<UpstreamOutcome> {
        match self {
            GobletError::UpstreamNetwork(_) => Some(UpstreamOutcome::Network),
            GobletError::UpstreamStatus(code) => Some(UpstreamOutcome::Status(*code)),
            GobletError::UpstreamProtocol(_) => Some(UpstreamOutcome::Protocol),
            GobletError::Timeout(_) => Some(UpstreamOutcome::Timeout),
            _ => None,
        }
    }
}

impl IntoResponse for GobletError {
    fn into_response(self) -> Response {
        let status = match &self {
            GobletError::Protocol(_) => StatusCode::BAD_REQUEST,
            GobletError::Unauthorized => StatusCode::UNAUTHORIZED,
            GobletError::Forbidden(_) => StatusCode::FORBIDDEN,
            GobletError::NotFound(_) => StatusCode::NOT_FOUND,
            GobletError::UpstreamNetwork(_)
            | GobletError::UpstreamStatus(_)
            | GobletError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            GobletError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GobletError::CacheCorruption { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GobletError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GobletError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            GobletError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GobletError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(error = %self, status = %status, "request failed");
        let mut response = (status, self.to_string()).into_response();
        if matches!(status, StatusCode::SERVICE_UNAVAILABLE) {
            response
                .headers_mut()
                .insert("Retry-After", "2".parse().unwrap());
        }
        response
    }
}
