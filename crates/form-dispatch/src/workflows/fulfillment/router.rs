use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tracing::warn;

use super::domain::{BatchId, WebhookPayload};
use super::queue::{idempotency_key, BatchQueue, BatchStatus, QueueError, Submission};
use crate::config::ProcessingMode;
use crate::error::{envelope, internal_error, AppError};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone)]
pub struct WebhookState {
    api_key: Arc<str>,
    queue: BatchQueue,
    mode: ProcessingMode,
}

impl WebhookState {
    pub fn new(api_key: impl Into<String>, queue: BatchQueue, mode: ProcessingMode) -> Self {
        Self {
            api_key: Arc::from(api_key.into()),
            queue,
            mode,
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token == &*self.api_key)
    }
}

/// Webhook ingress plus batch status lookups.
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", get(ready_handler).post(submit_handler))
        .route("/webhook/batches/:batch_id", get(status_handler))
        .with_state(state)
}

pub(crate) async fn ready_handler() -> Response {
    let payload = json!({
        "success": true,
        "status": "Webhook Ready",
        "message": "Webhook endpoint is live! Send a POST request with data.",
    });
    (StatusCode::OK, axum::Json(payload)).into_response()
}

pub(crate) async fn submit_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }

    let payload = match WebhookPayload::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "rejecting webhook payload");
            return AppError::from(err).into_response();
        }
    };

    let header = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok());
    let key = idempotency_key(header, &body);

    match state.mode {
        ProcessingMode::Deferred => match state.queue.submit(&key, payload.records) {
            Ok(submission) => accepted(&submission),
            Err(err) => AppError::from(err).into_response(),
        },
        ProcessingMode::Inline => process_inline(&state.queue, &key, payload)
            .await
            .unwrap_or_else(IntoResponse::into_response),
    }
}

async fn process_inline(
    queue: &BatchQueue,
    key: &str,
    payload: WebhookPayload,
) -> Result<Response, AppError> {
    let record = match queue.accept(key, payload.records)? {
        Submission::Enqueued(batch_id) => queue.process_now(&batch_id).await?,
        Submission::Duplicate(batch_id) => {
            let record = queue
                .status(&batch_id)?
                .ok_or_else(|| QueueError::NotFound(batch_id.clone()))?;
            if record.status.is_pending() {
                return Ok(accepted(&Submission::Duplicate(batch_id)));
            }
            record
        }
    };

    if let BatchStatus::Failed { reason } = &record.status {
        return Ok(internal_error(reason));
    }
    let payload = json!({
        "success": true,
        "status": "Success",
        "message": "Webhook received and processed successfully.",
        "batchId": record.batch_id,
        "processedData": record.report,
    });
    Ok((StatusCode::OK, axum::Json(payload)).into_response())
}

fn accepted(submission: &Submission) -> Response {
    let payload = json!({
        "success": true,
        "status": "Accepted",
        "message": "Webhook received. Processing in the background.",
        "batchId": submission.batch_id(),
        "duplicate": submission.is_duplicate(),
    });
    (StatusCode::ACCEPTED, axum::Json(payload)).into_response()
}

pub(crate) async fn status_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Path(batch_id): Path<String>,
) -> Response {
    if !state.authorized(&headers) {
        return unauthorized();
    }

    let Some(id) = BatchId::parse(&batch_id) else {
        return AppError::from(QueueError::NotFound(BatchId(batch_id))).into_response();
    };
    match state.queue.status(&id) {
        Ok(Some(record)) => (StatusCode::OK, axum::Json(record)).into_response(),
        Ok(None) => AppError::from(QueueError::NotFound(id)).into_response(),
        Err(err) => AppError::from(err).into_response(),
    }
}

fn unauthorized() -> Response {
    envelope(
        StatusCode::UNAUTHORIZED,
        "Invalid API key. Please provide a valid Bearer token.",
    )
}
