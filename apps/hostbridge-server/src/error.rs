//! Classified tool errors and their HTTP rendering.
//!
//! Handlers classify every failure into the stable [`ErrorKind`] taxonomy;
//! the dispatch engine remaps anything unclassified to `internal_error` with
//! a generic message (the original text lands in the audit row only).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hostbridge_protocol::{ErrorEnvelope, ErrorKind};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: Option<String>,
    pub suggestion_tool: Option<String>,
    /// Input-schema violations keep kind `invalid_parameter` but render as
    /// HTTP 422 instead of 400.
    pub schema_violation: bool,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
            suggestion_tool: None,
            schema_violation: false,
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::InvalidParameter, message);
        err.schema_violation = true;
        err
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message)
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Blocked, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_suggestion_tool(mut self, tool: impl Into<String>) -> Self {
        self.suggestion_tool = Some(tool.into());
        self
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let mut env = ErrorEnvelope::new(self.kind, self.message.clone());
        env.suggestion = self.suggestion.clone();
        env.suggestion_tool = self.suggestion_tool.clone();
        env
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        ToolError::internal(err.to_string())
    }
}

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        let code = if self.schema_violation {
            422
        } else {
            self.kind.http_status()
        };
        let status =
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.envelope())).into_response()
    }
}
