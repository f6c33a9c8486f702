use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{ErrorKind, SandboxError};
use crate::store::StoreError;

/// API-facing error: a classified failure plus the HTTP status it maps to.
pub struct ApiError {
    pub status: StatusCode,
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub operation: Option<String>,
    pub provider: Option<crate::types::Provider>,
    pub sandbox_id: Option<String>,
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::plain(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::plain(StatusCode::NOT_FOUND, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::plain(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    fn plain(status: StatusCode, msg: impl Into<String>) -> Self {
        ApiError {
            status,
            kind: None,
            message: msg.into(),
            operation: None,
            provider: None,
            sandbox_id: None,
            retry_after_ms: None,
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Provider | ErrorKind::Network => StatusCode::BAD_GATEWAY,
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        ApiError {
            status: status_for(e.kind),
            kind: Some(e.kind),
            message: e.message,
            operation: if e.context.operation.is_empty() {
                None
            } else {
                Some(e.context.operation)
            },
            provider: e.context.provider,
            sandbox_id: e.context.sandbox_id,
            retry_after_ms: e.retry_after_ms,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::not_found(what),
            StoreError::Backend(msg) => ApiError::internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "kind": self.kind.map(|k| k.as_str()),
            "operation": self.operation,
        });
        if let Some(provider) = self.provider {
            body["provider"] = json!(provider);
        }
        if let Some(sandbox_id) = self.sandbox_id {
            body["sandboxId"] = json!(sandbox_id);
        }
        let mut response = (self.status, Json(body)).into_response();
        if let Some(ms) = self.retry_after_ms {
            let secs = ms.div_ceil(1000).to_string();
            if let Ok(value) = HeaderValue::from_str(&secs) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
