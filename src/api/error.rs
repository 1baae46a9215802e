//! Error responses in the `{data, meta}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

use crate::storage::StoreError;
use crate::trigger::TriggerError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    data: Value,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            data: Value::Null,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "data": self.data,
            "meta": {
                "error": self.message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store query failed");
        if matches!(err, StoreError::Contention { .. }) {
            return Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: err.to_string(),
                data: Value::Null,
            };
        }
        Self::internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        error!(error = %err, "blocking query task failed");
        Self::internal("internal error")
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Cooldown { remaining_secs } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: err.to_string(),
                data: json!({ "remaining_secs": remaining_secs }),
            },
            TriggerError::ScriptMissing(_) | TriggerError::Launch(_) => Self::internal(err.to_string()),
            TriggerError::Store(store) => Self::from(store),
            TriggerError::Task(join) => Self::from(join),
        }
    }
}
