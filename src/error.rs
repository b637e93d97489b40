//! Error taxonomy shared by the server and client halves of the engine.
//!
//! Every kind carries a human-readable message. Kinds that correspond to an
//! HTTP status surface it through [`HttpError::status_code`]; transport and
//! abort failures stay local to the engine and never map to a wire status.

use thiserror::Error;

use crate::http::StatusCode;

/// A status-bearing engine error.
///
/// Generators return these to have the server emit the matching error
/// response; client transfers deliver them through the sink's error path.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// 404 Not Found
    #[error("{0}")]
    NotFound(String),

    /// 405 Not Allowed
    #[error("{0}")]
    NotAllowed(String),

    /// 401 Not Authorized
    #[error("{0}")]
    NotAuthorized(String),

    /// 403 Forbidden
    #[error("{0}")]
    Forbidden(String),

    /// 400 Bad Request
    #[error("{0}")]
    BadRequest(String),

    /// 304 Not Modified; a success variant on the client side only
    #[error("{0}")]
    NotModified(String),

    /// 503 Service Unavailable
    #[error("{0}")]
    Unavailable(String),

    /// 500 Internal Server Error; the default mapping for unknown failures
    #[error("{0}")]
    InternalError(String),

    /// Raised from `check_aborted` when the peer has gone away
    #[error("request aborted")]
    RequestAborted,

    /// Transport or setup failure on the client; never crosses the wire
    #[error("{0}")]
    Transport(String),
}

impl HttpError {
    /// The HTTP status this error maps to when surfaced over the wire.
    ///
    /// `RequestAborted` and `Transport` are engine-internal and have none.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            HttpError::NotFound(_) => Some(StatusCode::NotFound),
            HttpError::NotAllowed(_) => Some(StatusCode::NotAllowed),
            HttpError::NotAuthorized(_) => Some(StatusCode::NotAuthorized),
            HttpError::Forbidden(_) => Some(StatusCode::Forbidden),
            HttpError::BadRequest(_) => Some(StatusCode::BadRequest),
            HttpError::NotModified(_) => Some(StatusCode::NotModified),
            HttpError::Unavailable(_) => Some(StatusCode::ServiceUnavailable),
            HttpError::InternalError(_) => Some(StatusCode::InternalServerError),
            HttpError::RequestAborted | HttpError::Transport(_) => None,
        }
    }
}
