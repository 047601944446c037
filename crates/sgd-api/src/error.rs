// SPDX-License-Identifier: MIT OR Apache-2.0
//! Translation from the core error taxonomy (and this crate's own request
//! handling failures) to HTTP responses.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sgd_core::SgdError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub category: &'static str,
    pub message: String,
    pub field: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, category: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            category,
            message: message.into(),
            field: None,
            retry_after_seconds: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "validation", message)
    }
}

impl From<SgdError> for ApiError {
    fn from(error: SgdError) -> Self {
        let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let category = error.category();
        let retry_after_seconds = error.retry_after_seconds();
        let field = match &error {
            SgdError::Validation { field, .. } => field.clone(),
            _ => None,
        };
        ApiError {
            status,
            category: category_label(category),
            message: error.to_string(),
            field,
            retry_after_seconds,
        }
    }
}

/// `ErrorCategory` only implements `Display`; this gives handlers a
/// `'static` label to embed in the response body without allocating twice.
fn category_label(category: sgd_core::ErrorCategory) -> &'static str {
    use sgd_core::ErrorCategory::*;
    match category {
        ContentPolicyViolation => "content_policy_violation",
        Validation => "validation",
        AuthFailed => "authn_authz",
        RateLimitExceeded => "rate_limit_exceeded",
        BudgetExceeded => "budget_exceeded",
        ProviderError => "provider_error",
        BreakerOpen => "breaker_open",
        StorageError => "storage_error",
        VectorError => "vector_error",
        CacheError => "cache_error",
        JobNotFound => "job_not_found",
        JobTerminal => "job_terminal",
        SecurityThreat => "security_threat",
        Internal => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.category,
            "message": self.message,
        });
        if let Some(field) = &self.field {
            body["field"] = json!(field);
        }
        if let Some(retry_after) = self.retry_after_seconds {
            body["retry_after_seconds"] = json!(retry_after);
        }

        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            response.headers_mut().insert("retry-after", value);
        }
        response
    }
}
