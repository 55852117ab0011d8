//! Retry-eligibility classification.
//!
//! Eligibility is separate from retry scheduling: the retry script only sees
//! failures this classifier lets through. Everything else is finalized as a
//! terminal failure.

use bridgemq_models::JobErrorRecord;

/// What happens to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Route through the retry script (backoff or DLQ).
    Retry,
    /// Finalize as `failed` without retrying.
    Terminal,
}

/// Classify a handler failure.
///
/// A failure is retry-eligible iff retries are enabled for the job, the
/// error does not carry an explicit `retryable = false`, and its code is not
/// in the non-retryable set (invalid payload, invalid config, capability
/// mismatch).
pub fn classify_failure(retry_enabled: bool, error: &JobErrorRecord) -> FailureDisposition {
    if !retry_enabled {
        return FailureDisposition::Terminal;
    }
    if error.retryable == Some(false) {
        return FailureDisposition::Terminal;
    }
    if !error.code.is_retryable() {
        return FailureDisposition::Terminal;
    }
    FailureDisposition::Retry
}
