use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use depflow_core::FlowError;

// ---------------------------------------------------------------------------
// Sentinels for statuses FlowError has no variant for
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ConflictError(String);

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConflictError {}

#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(ConflictError(msg.into()).into())
    }

    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<ConflictError>().is_some() {
            return StatusCode::CONFLICT;
        }
        if self.0.downcast_ref::<BadRequestError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        let Some(e) = self.0.downcast_ref::<FlowError>() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match e {
            FlowError::SubscriptionNotFound(_)
            | FlowError::BuildNotFound(_)
            | FlowError::ChannelNotFound(_)
            | FlowError::HistoryNotFound(_) => StatusCode::NOT_FOUND,
            FlowError::InvalidActorId(_)
            | FlowError::InvalidFrequency(_)
            | FlowError::InvalidTrigger(_)
            | FlowError::NotInitialized => StatusCode::BAD_REQUEST,
            FlowError::LeaseHeld { .. } | FlowError::LeaseLost { .. } => StatusCode::CONFLICT,
            FlowError::HostUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FlowError::HostRejected(_)
            | FlowError::PolicyEvaluation(_)
            | FlowError::Store(_)
            | FlowError::StaleReceipt(_)
            | FlowError::Cancelled
            | FlowError::Io(_)
            | FlowError::Yaml(_)
            | FlowError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
