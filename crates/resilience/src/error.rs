use std::sync::Arc;
use thiserror::Error;

use crate::retry::is_retryable_error;

/// Failure reported by a device backend.
///
/// Backends are opaque collaborators, so the variants only carry enough shape
/// for the classifier to decide between "try again" and "give up".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The call did not finish in time.
    #[error("backend timed out: {0}")]
    Timeout(String),
    /// Transport-level failure (refused, reset, DNS, ...).
    #[error("backend connection failed: {0}")]
    Connection(String),
    /// The backend understood the request and refused it.
    #[error("backend rejected request: {0}")]
    Rejected(String),
    /// The backend answered with the wrong number or shape of vectors.
    #[error("malformed backend response: {0}")]
    Malformed(String),
    /// Anything else. Classified by message.
    #[error("backend failure: {0}")]
    Other(String),
}

/// Predicate deciding whether a [`BackendError`] is transient (retryable).
pub type Classifier = Arc<dyn Fn(&BackendError) -> bool + Send + Sync>;

/// Default transient/permanent split.
///
/// Timeouts and connection errors retry, rejections and malformed responses
/// don't, and opaque errors fall back to the status-code heuristic in
/// [`is_retryable_error`].
pub fn default_classifier() -> Classifier {
    Arc::new(|err: &BackendError| match err {
        BackendError::Timeout(_) | BackendError::Connection(_) => true,
        BackendError::Rejected(_) | BackendError::Malformed(_) => false,
        BackendError::Other(message) => is_retryable_error(message),
    })
}

/// Result of one backend attempt after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Ok(T),
    Transient(BackendError),
    Permanent(BackendError),
}

impl<T> CallOutcome<T> {
    pub fn classify(result: Result<T, BackendError>, classifier: &Classifier) -> Self {
        match result {
            Ok(value) => CallOutcome::Ok(value),
            Err(err) if classifier(&err) => CallOutcome::Transient(err),
            Err(err) => CallOutcome::Permanent(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }
}

/// Why a guarded call did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardError {
    /// The breaker rejected the call without touching the backend.
    #[error("circuit open for `{name}`")]
    CircuitOpen { name: String },
    /// Every attempt failed with a transient error.
    #[error("`{name}` still failing after {attempts} attempts: {last}")]
    Exhausted {
        name: String,
        attempts: u32,
        last: BackendError,
    },
    /// The backend failed in a way retrying will not fix.
    #[error("`{name}` failed permanently: {error}")]
    Permanent { name: String, error: BackendError },
    /// The caller cancelled or the deadline passed.
    #[error("request cancelled")]
    Cancelled,
}

impl GuardError {
    /// True when an alternate device might still succeed.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, GuardError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classifier_splits_transient_and_permanent() {
        let classify = default_classifier();
        assert!(classify(&BackendError::Timeout("30s".into())));
        assert!(classify(&BackendError::Connection("refused".into())));
        assert!(!classify(&BackendError::Rejected("bad token".into())));
        assert!(!classify(&BackendError::Malformed("2 vectors for 3 inputs".into())));
        assert!(classify(&BackendError::Other("HTTP 503".into())));
        assert!(!classify(&BackendError::Other("HTTP 401".into())));
    }

    #[test]
    fn call_outcome_uses_classifier() {
        let classify = default_classifier();
        let ok: CallOutcome<u8> = CallOutcome::classify(Ok(1), &classify);
        assert!(ok.is_ok());

        let transient: CallOutcome<u8> =
            CallOutcome::classify(Err(BackendError::Timeout("t".into())), &classify);
        assert!(matches!(transient, CallOutcome::Transient(_)));

        let permanent: CallOutcome<u8> =
            CallOutcome::classify(Err(BackendError::Rejected("r".into())), &classify);
        assert!(matches!(permanent, CallOutcome::Permanent(_)));
    }

    #[test]
    fn custom_classifier_overrides_default() {
        let never: Classifier = Arc::new(|_| false);
        let outcome: CallOutcome<()> =
            CallOutcome::classify(Err(BackendError::Timeout("t".into())), &never);
        assert!(matches!(outcome, CallOutcome::Permanent(_)));
    }

    #[test]
    fn guard_error_messages() {
        let err = GuardError::Exhausted {
            name: "cpu".into(),
            attempts: 3,
            last: BackendError::Timeout("slow".into()),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.to_string().contains("slow"));
        assert!(!GuardError::Cancelled.allows_fallback());
        assert!(GuardError::CircuitOpen { name: "gpu:0".into() }.allows_fallback());
    }
}
