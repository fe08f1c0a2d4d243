use thiserror::Error;

/// Errors raised inside the cache tiers.
///
/// The hierarchy absorbs all of these into a miss; they surface only through
/// the individual tier APIs and the statistics counters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    /// The shared store could not be reached or refused the operation.
    #[error("cache tier `{tier}` unavailable: {reason}")]
    Unavailable { tier: String, reason: String },
    /// A stored vector could not be turned back into floats.
    #[error("quantization error: {0}")]
    Quantization(String),
    /// Stored bytes did not decode into an entry.
    #[error("cache entry codec error: {0}")]
    Codec(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Every resident entry is pinned, so nothing can be evicted.
    #[error("cache full: all {capacity} entries are pinned")]
    CapacityPinned { capacity: usize },
}

impl CacheError {
    pub fn unavailable<E: std::fmt::Display>(tier: &str, err: E) -> Self {
        Self::Unavailable {
            tier: tier.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<bincode::error::EncodeError> for CacheError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CacheError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CacheError::Codec(e.to_string())
    }
}
