//! Typed error kinds and their HTTP / session dispositions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Everything that can go wrong while serving a document.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document not found")]
    NotFound,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("operation base version {base} is ahead of document version {current}")]
    InvalidBaseVersion { base: u64, current: u64 },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    Store(anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Message sent to the client in an `error_message` event. Store errors
    /// are reported as transient so clients may resubmit.
    pub fn session_message(&self) -> String {
        match self {
            Error::Store(_) => "temporary server error, please retry".to_string(),
            other => other.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::InvalidOperation(_) | Error::InvalidBaseVersion { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Transient(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if matches!(self, Error::Transient(_) | Error::Store(_)) {
            error!("request failed: {:#}", self);
        }
        (self.status(), self.to_string()).into_response()
    }
}
