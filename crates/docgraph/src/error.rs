//! Typed errors for the extraction pipeline.
//!
//! Uses `thiserror` for library errors. The taxonomy distinguishes
//! throttling-class failures (retried with backoff) from fatal service
//! failures (abort the current stage, keep prior-stage results) and from
//! daily-quota exhaustion (fail fast, never retried).

use std::time::Duration;

use thiserror::Error;

/// Errors from external service calls (completion, embedding, OCR).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Rate-limit rejection or transient server failure; retryable.
    #[error("service throttled")]
    Throttled {
        /// Server-suggested wait, when provided.
        retry_after: Option<Duration>,
    },

    /// Daily call ceiling already exhausted; fails fast, never retried.
    #[error("daily call quota exhausted")]
    QuotaExceeded,

    /// Malformed-request class; aborts immediately without retry.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Authentication or authorization failure; not retryable.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure with no HTTP classification.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered but the payload was unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Backoff schedule exhausted; carries the final throttle message.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Cooperative cancellation observed between work units.
    #[error("operation cancelled")]
    Cancelled,
}

impl ServiceError {
    /// Throttling-class failures are the only retryable ones.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Throttled { .. })
    }
}

/// Errors from the fallback parser chain.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("structured parse failed: {0}")]
    Structured(String),

    #[error("OCR parse failed: {0}")]
    Ocr(String),

    #[error("plain-text parse failed: {0}")]
    PlainText(String),

    /// Every strategy in the chain failed; parse-fatal for the document.
    #[error("all parse strategies exhausted")]
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttled_is_retryable() {
        assert!(ServiceError::Throttled { retry_after: None }.is_retryable());
        assert!(!ServiceError::QuotaExceeded.is_retryable());
        assert!(!ServiceError::BadRequest("nope".into()).is_retryable());
        assert!(!ServiceError::RetriesExhausted {
            attempts: 5,
            last: "throttled".into()
        }
        .is_retryable());
    }
}
