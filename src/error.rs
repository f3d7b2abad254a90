use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::completion::TransportError;
use crate::normalize::NormalizeError;

/// Everything that can end a `/query` request early.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Input(String),
    #[error("request body exceeded {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("completion provider is not configured (OPENAI_API_KEY unset)")]
    Unconfigured,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("handler panicked: {0}")]
    Panic(String),
}

/// Uniform client-facing error body.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::Input(_) => StatusCode::BAD_REQUEST,
            QueryError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            QueryError::Unconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            QueryError::Transport(_) => StatusCode::BAD_GATEWAY,
            QueryError::Normalize(_) | QueryError::Panic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used in logs, telemetry records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Input(_) => "input",
            QueryError::PayloadTooLarge { .. } => "payload_too_large",
            QueryError::Unconfigured => "unconfigured",
            QueryError::Transport(_) => "transport",
            QueryError::Normalize(e) => e.kind(),
            QueryError::Panic(_) => "panic",
        }
    }

    fn public_message(&self) -> String {
        match self {
            // Client-caused errors are safe to describe in full.
            QueryError::Input(_) | QueryError::PayloadTooLarge { .. } => self.to_string(),
            QueryError::Unconfigured => "Service is not configured to answer queries".into(),
            QueryError::Transport(_) => "Failed to reach the completion provider".into(),
            QueryError::Normalize(_) => "Failed to process query".into(),
            QueryError::Panic(_) => "Internal server error".into(),
        }
    }

    /// Diagnostic detail shown only in development mode. Parse failures
    /// include the raw completion text.
    fn detail(&self) -> String {
        match self {
            QueryError::Normalize(NormalizeError::Parse { raw, source }) => {
                format!("completion is not valid JSON ({}): {}", source, raw)
            }
            other => other.to_string(),
        }
    }

    /// Panic payloads never reach the client, even in development mode.
    pub fn to_body(&self, expose_details: bool) -> ErrorBody {
        let expose = expose_details && !matches!(self, QueryError::Panic(_));
        ErrorBody {
            error: self.public_message(),
            details: expose.then(|| self.detail()),
        }
    }

    pub fn into_response_with(self, expose_details: bool) -> Response {
        (self.status(), Json(self.to_body(expose_details))).into_response()
    }
}

/// Render the cause chain of an error, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push(cause.to_string());
        current = cause.source();
    }
    chain
}
