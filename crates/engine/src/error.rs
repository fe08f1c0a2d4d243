use resilience::GuardError;
use thiserror::Error;

/// Input rejected before any cache tier or device is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request contains no texts")]
    EmptyRequest,
    #[error("text at index {index} is empty")]
    EmptyText { index: usize },
    #[error("text at index {index} has {len} chars, limit is {max}")]
    TextTooLong { index: usize, len: usize, max: usize },
    #[error("request has {count} texts, limit is {max}")]
    TooManyTexts { count: usize, max: usize },
    /// `probes` must be absent or hold exactly one vector per text, each of
    /// the deployment dimension.
    #[error("probe vectors do not line up with the texts")]
    ProbeCountMismatch,
}

/// Errors surfaced by [`crate::Engine`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    /// No device produced vectors after retries, breaker checks and the
    /// single fallback.
    #[error("no backend available (last tried `{device}`): {cause}")]
    BackendUnavailable { device: String, cause: GuardError },
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid engine configuration: {0}")]
    Config(String),
    /// A device task died without reporting a result.
    #[error("internal engine failure: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }

    /// True when the failure came from the device side rather than the caller.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, EngineError::BackendUnavailable { .. })
    }
}
