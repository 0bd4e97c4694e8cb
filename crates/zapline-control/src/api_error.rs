use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use zapline_supervisor::{ControlError, SupervisorError};

const MAX_MESSAGE_BYTES: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Error returned by every handler: an HTTP status plus a stable machine code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn bot_not_active() -> Self {
        Self::new(StatusCode::CONFLICT, "bot_not_active", "bot is not active")
    }

    /// Logs the underlying error and hides it from the client.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "request failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal server error",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: truncate_utf8(&self.message, MAX_MESSAGE_BYTES),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::NotFound(bot_id) => {
                Self::not_found(format!("bot {bot_id} has no running instance"))
            }
            SupervisorError::UnknownBot(bot_id) => {
                Self::not_found(format!("bot {bot_id} not found"))
            }
            SupervisorError::InvalidBotId { bot_id, .. } => {
                Self::invalid_request(format!("bot {bot_id} cannot be assigned a port"))
            }
            SupervisorError::ShuttingDown => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "server is shutting down",
            ),
            SupervisorError::SpawnFailed { bot_id, reason } => {
                tracing::warn!(%bot_id, %reason, "start failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "spawn_failed",
                    "failed to start bot instance",
                )
            }
            SupervisorError::ExitedEarly { bot_id, code } => {
                tracing::warn!(%bot_id, ?code, "start failed: worker exited");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "spawn_failed",
                    "bot instance exited during startup",
                )
            }
            SupervisorError::Control(ControlError::Unreachable { .. }) => Self::new(
                StatusCode::BAD_GATEWAY,
                "instance_unreachable",
                "bot instance is not reachable",
            ),
            SupervisorError::Control(ControlError::Rejected { message, .. }) => Self::new(
                StatusCode::BAD_GATEWAY,
                "instance_rejected",
                format!("bot instance rejected the request: {message}"),
            ),
            SupervisorError::Control(ControlError::Decode { .. }) => Self::new(
                StatusCode::BAD_GATEWAY,
                "instance_rejected",
                "bot instance sent an invalid response",
            ),
            err @ (SupervisorError::WorkingDir { .. } | SupervisorError::Store(_)) => {
                Self::internal(err)
            }
        }
    }
}
