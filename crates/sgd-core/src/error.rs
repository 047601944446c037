//! Typed error taxonomy shared by every component of the render core.
//!
//! Each variant maps onto exactly one failure kind a caller needs to branch
//! on (HTTP status, retry eligibility, breaker trip eligibility). Internal
//! plumbing errors that no caller pattern-matches on are wrapped in
//! [`SgdError::Internal`] rather than growing the enum.

use std::fmt;
use thiserror::Error;

/// Canonical error kind, independent of any transport.
#[derive(Debug, Error)]
pub enum SgdError {
    #[error("content policy violation: {reason}")]
    ContentPolicyViolation { reason: String },

    #[error("validation failed: {message}")]
    Validation { message: String, field: Option<String> },

    #[error("authentication/authorization failed: {message}")]
    AuthFailed { message: String },

    #[error("rate limit exceeded for {identifier}/{endpoint}")]
    RateLimitExceeded {
        identifier: String,
        endpoint: String,
        retry_after_seconds: u64,
    },

    #[error("daily budget exceeded for org {org_id}")]
    BudgetExceeded {
        org_id: String,
        retry_after_seconds: u64,
    },

    #[error("provider call failed for task {task}: {cause}")]
    ProviderError { task: String, cause: String },

    #[error("circuit breaker '{name}' is open")]
    BreakerOpen { name: String },

    #[error("storage error: {message}")]
    StorageError { message: String },

    #[error("vector index error: {message}")]
    VectorError { message: String },

    #[error("cache error: {message}")]
    CacheError { message: String },

    #[error("job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("job {job_id} is already in a terminal state")]
    JobTerminal { job_id: String },

    #[error("security threat detected: {threats:?}")]
    SecurityThreat {
        threats: Vec<String>,
        quarantine_key: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SgdError {
    pub fn validation(message: impl Into<String>) -> Self {
        SgdError::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        SgdError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// The broad category this error belongs to: content policy, input
    /// validation, auth, rate/budget limiting, upstream provider, breaker
    /// state, a storage tier, or an internal bug.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SgdError::ContentPolicyViolation { .. } => ErrorCategory::ContentPolicyViolation,
            SgdError::Validation { .. } => ErrorCategory::Validation,
            SgdError::AuthFailed { .. } => ErrorCategory::AuthFailed,
            SgdError::RateLimitExceeded { .. } => ErrorCategory::RateLimitExceeded,
            SgdError::BudgetExceeded { .. } => ErrorCategory::BudgetExceeded,
            SgdError::ProviderError { .. } => ErrorCategory::ProviderError,
            SgdError::BreakerOpen { .. } => ErrorCategory::BreakerOpen,
            SgdError::StorageError { .. } => ErrorCategory::StorageError,
            SgdError::VectorError { .. } => ErrorCategory::VectorError,
            SgdError::CacheError { .. } => ErrorCategory::CacheError,
            SgdError::JobNotFound { .. } => ErrorCategory::JobNotFound,
            SgdError::JobTerminal { .. } => ErrorCategory::JobTerminal,
            SgdError::SecurityThreat { .. } => ErrorCategory::SecurityThreat,
            SgdError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// The HTTP status this error maps to per the API layer's translation table.
    pub fn status_code(&self) -> u16 {
        match self {
            SgdError::ContentPolicyViolation { .. } => 400,
            SgdError::Validation { .. } => 422,
            SgdError::AuthFailed { .. } => 401,
            SgdError::RateLimitExceeded { .. } => 429,
            SgdError::BudgetExceeded { .. } => 429,
            SgdError::ProviderError { .. } => 502,
            SgdError::BreakerOpen { .. } => 503,
            SgdError::StorageError { .. } | SgdError::VectorError { .. } | SgdError::CacheError { .. } => 500,
            SgdError::JobNotFound { .. } => 404,
            SgdError::JobTerminal { .. } => 400,
            SgdError::SecurityThreat { .. } => 400,
            SgdError::Internal(_) => 500,
        }
    }

    /// `Retry-After` seconds, when the error kind carries authoritative reset metadata.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            SgdError::RateLimitExceeded {
                retry_after_seconds,
                ..
            }
            | SgdError::BudgetExceeded {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Whether a retry loop (provider client, breaker) should count this as a failure.
    ///
    /// Excluded kinds (validation, content policy, auth) never trip a breaker or
    /// consume a retry attempt — they are not transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SgdError::ProviderError { .. } | SgdError::CacheError { .. })
    }

    /// Whether this error kind counts as a failure for circuit-breaker bookkeeping.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            SgdError::ProviderError { .. } | SgdError::StorageError { .. } | SgdError::VectorError { .. }
        )
    }
}

/// Stable category tag, independent of the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ContentPolicyViolation,
    Validation,
    AuthFailed,
    RateLimitExceeded,
    BudgetExceeded,
    ProviderError,
    BreakerOpen,
    StorageError,
    VectorError,
    CacheError,
    JobNotFound,
    JobTerminal,
    SecurityThreat,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::ContentPolicyViolation => "content_policy_violation",
            ErrorCategory::Validation => "validation",
            ErrorCategory::AuthFailed => "authn_authz",
            ErrorCategory::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCategory::BudgetExceeded => "budget_exceeded",
            ErrorCategory::ProviderError => "provider_error",
            ErrorCategory::BreakerOpen => "breaker_open",
            ErrorCategory::StorageError => "storage_error",
            ErrorCategory::VectorError => "vector_error",
            ErrorCategory::CacheError => "cache_error",
            ErrorCategory::JobNotFound => "job_not_found",
            ErrorCategory::JobTerminal => "job_terminal",
            ErrorCategory::SecurityThreat => "security_threat",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(s)
    }
}

pub type SgdResult<T> = Result<T, SgdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_never_trips_breaker_or_retries() {
        let e = SgdError::validation("bad field");
        assert!(!e.is_retryable());
        assert!(!e.trips_breaker());
        assert_eq!(e.status_code(), 422);
    }

    #[test]
    fn provider_error_is_retryable_and_trips_breaker() {
        let e = SgdError::ProviderError {
            task: "planner".into(),
            cause: "timeout".into(),
        };
        assert!(e.is_retryable());
        assert!(e.trips_breaker());
        assert_eq!(e.status_code(), 502);
    }

    #[test]
    fn budget_exceeded_carries_retry_after() {
        let e = SgdError::BudgetExceeded {
            org_id: "org1".into(),
            retry_after_seconds: 3600,
        };
        assert_eq!(e.retry_after_seconds(), Some(3600));
        assert_eq!(e.status_code(), 429);
    }

    #[test]
    fn content_policy_is_400_and_not_retryable() {
        let e = SgdError::ContentPolicyViolation {
            reason: "banned term".into(),
        };
        assert_eq!(e.status_code(), 400);
        assert!(!e.is_retryable());
    }
}
