//! Error taxonomy for the job queue runtime.
//!
//! Every error a worker can raise boils down to one of a small set of
//! *kinds*: permanent (no point retrying), retryable (transient, maybe with
//! a server-provided retry date), a rate limit (retryable, but also updates
//! a limiter), a timeout (retryable unless attempts are exhausted), an abort
//! (cooperative cancellation, terminal but not a failure), or a handler
//! that was never registered. The queue classifies on this enum rather than
//! inspecting message strings.

use std::time::SystemTime;
use thiserror::Error;

/// Coarse classification persisted alongside a failed or retrying job.
///
/// This is the `errorKind` field on the persisted job record: callers that
/// only care "should I show a retry countdown or a dead-end" can match on
/// this without knowing the full [`QueueError`] shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    Permanent,
    Retryable,
    RateLimit,
    Timeout,
    Aborted,
    MissingRunFn,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Retryable => "retryable",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::MissingRunFn => "missing_run_fn",
        };
        f.write_str(s)
    }
}

/// An error raised by a `runFn`, a limiter, or the queue itself.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Input failed schema validation. Terminal; surfaces as `FAILED(permanent)`.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Business failure with no prospect of success on retry. Terminal.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Transient failure. Re-enqueued, honouring `retry_date` if present.
    #[error("retryable failure: {message}")]
    Retryable {
        message: String,
        retry_date: Option<SystemTime>,
    },

    /// Subclass of retryable that also updates a limiter's `nextAvailableAt`.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_date: Option<SystemTime>,
    },

    /// Subclass of retryable unless `attempts >= maxAttempts`.
    #[error("timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// Cooperative cancellation. Terminal `ABORTED`, never `FAILED`.
    #[error("aborted: {0}")]
    Aborted(String),

    /// No registered handler for `(taskType, provider)`. Terminal `FAILED`.
    #[error("no run function registered for task type {task_type:?} provider {provider:?}")]
    MissingRunFn { task_type: String, provider: String },

    /// The storage backend failed on a read/write the queue depends on.
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Coarse kind used for the persisted job record and for retry decisions.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            QueueError::Validation(_) => ErrorKind::Validation,
            QueueError::Permanent(_) => ErrorKind::Permanent,
            QueueError::Retryable { .. } => ErrorKind::Retryable,
            QueueError::RateLimit { .. } => ErrorKind::RateLimit,
            QueueError::Timeout { .. } => ErrorKind::Timeout,
            QueueError::Aborted(_) => ErrorKind::Aborted,
            QueueError::MissingRunFn { .. } => ErrorKind::MissingRunFn,
            QueueError::Storage(_) => ErrorKind::Retryable,
            QueueError::Serialization(_) => ErrorKind::Permanent,
        }
    }

    /// Whether a job ending with this error should ever be retried.
    ///
    /// A timeout stops being retryable once `attempts` has exhausted
    /// `max_attempts`; the caller passes that in because the error itself
    /// doesn't know the job's attempt count.
    pub fn is_retryable(&self, attempts: u32, max_attempts: u32) -> bool {
        match self {
            QueueError::Validation(_)
            | QueueError::Permanent(_)
            | QueueError::Aborted(_)
            | QueueError::MissingRunFn { .. } => false,
            QueueError::Retryable { .. } | QueueError::RateLimit { .. } | QueueError::Storage(_) => {
                attempts < max_attempts
            }
            QueueError::Timeout { .. } => attempts < max_attempts,
            QueueError::Serialization(_) => false,
        }
    }

    /// The explicit retry date carried by retryable/rate-limit errors, if any.
    pub fn retry_date(&self) -> Option<SystemTime> {
        match self {
            QueueError::Retryable { retry_date, .. } => *retry_date,
            QueueError::RateLimit { retry_date, .. } => *retry_date,
            _ => None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        QueueError::Retryable {
            message: message.into(),
            retry_date: None,
        }
    }

    pub fn retryable_at(message: impl Into<String>, retry_date: SystemTime) -> Self {
        QueueError::Retryable {
            message: message.into(),
            retry_date: Some(retry_date),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_date: Option<SystemTime>) -> Self {
        QueueError::RateLimit {
            message: message.into(),
            retry_date,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_stops_being_retryable_once_attempts_exhausted() {
        let err = QueueError::Timeout {
            operation: "fetch".into(),
            duration_ms: 1000,
        };
        assert!(err.is_retryable(1, 3));
        assert!(!err.is_retryable(3, 3));
    }

    #[test]
    fn permanent_errors_are_never_retryable() {
        let err = QueueError::Permanent("no such model".into());
        assert!(!err.is_retryable(0, 10));
    }

    #[test]
    fn error_kind_matches_variant() {
        assert_eq!(
            QueueError::Validation("bad".into()).error_kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            QueueError::MissingRunFn {
                task_type: "Embed".into(),
                provider: "local".into()
            }
            .error_kind(),
            ErrorKind::MissingRunFn
        );
    }
}
