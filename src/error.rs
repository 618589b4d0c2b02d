use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures of the proxy pipeline.
///
/// `Clone` because a single upstream outcome is handed to every request
/// waiting on the same in-flight fetch.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("upstream credentials are not configured")]
    Configuration,

    #[error("upstream responded with {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("upstream connection failed: {0}")]
    Connection(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

/// Stable JSON error body returned to clients.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorBody {
    pub fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            status: None,
        }
    }
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Configuration | ProxyError::Connection(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ProxyError::Configuration => ErrorBody::new(
                "Server Configuration Error",
                "Upstream API credentials are not configured",
            ),
            ProxyError::Upstream { status, message } => ErrorBody {
                error: "Upstream API Error",
                message: message.clone(),
                status: Some(*status),
            },
            ProxyError::Connection(_) => {
                ErrorBody::new("Internal Server Error", "Failed to connect to upstream API")
            }
            ProxyError::BadRequest(message) => ErrorBody::new("Bad Request", message.clone()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}
