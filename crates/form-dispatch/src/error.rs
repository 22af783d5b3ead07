use crate::config::ConfigError;
use crate::telemetry::TelemetryError;
use crate::workflows::fulfillment::{
    NotifyError, PayloadError, QueueError, StampError, StoreError,
};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;
use tracing::error;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Http(reqwest::Error),
    Payload(PayloadError),
    Json(serde_json::Error),
    Queue(QueueError),
    Stamp(StampError),
    Store(StoreError),
    Notify(NotifyError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Http(err) => write!(f, "http client error: {}", err),
            AppError::Payload(err) => write!(f, "invalid payload: {}", err),
            AppError::Json(err) => write!(f, "json error: {}", err),
            AppError::Queue(err) => write!(f, "queue error: {}", err),
            AppError::Stamp(err) => write!(f, "stamping error: {}", err),
            AppError::Store(err) => write!(f, "document store error: {}", err),
            AppError::Notify(err) => write!(f, "notifier error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Http(err) => Some(err),
            AppError::Payload(err) => Some(err),
            AppError::Json(err) => Some(err),
            AppError::Queue(err) => Some(err),
            AppError::Stamp(err) => Some(err),
            AppError::Store(err) => Some(err),
            AppError::Notify(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Payload(err) => envelope(StatusCode::BAD_REQUEST, err.to_string()),
            AppError::Queue(QueueError::NotFound(batch_id)) => {
                envelope(StatusCode::NOT_FOUND, format!("Batch {batch_id} not found."))
            }
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_)
            | AppError::Http(_)
            | AppError::Json(_)
            | AppError::Queue(_)
            | AppError::Stamp(_)
            | AppError::Store(_)
            | AppError::Notify(_) => internal_error(&self.to_string()),
        }
    }
}

/// `{success: false, status, message}` body shared by every webhook error.
pub(crate) fn envelope(status: StatusCode, message: impl Into<String>) -> Response {
    let payload = json!({
        "success": false,
        "status": status.canonical_reason().unwrap_or("Error"),
        "message": message.into(),
    });
    (status, Json(payload)).into_response()
}

pub(crate) fn internal_error(details: &str) -> Response {
    error!(details, "webhook processing failed");
    let payload = json!({
        "success": false,
        "status": "Internal Server Error",
        "message": "An unexpected error occurred while processing the webhook.",
        "errorDetails": details,
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl From<PayloadError> for AppError {
    fn from(value: PayloadError) -> Self {
        Self::Payload(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<QueueError> for AppError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

impl From<StampError> for AppError {
    fn from(value: StampError) -> Self {
        Self::Stamp(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<NotifyError> for AppError {
    fn from(value: NotifyError) -> Self {
        Self::Notify(value)
    }
}
