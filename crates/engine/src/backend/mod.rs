//! Vector-producing backends.
//!
//! The engine treats a backend as a black box that turns a batch of texts into
//! one vector per text. Every device registered with the scheduler owns one.

#[cfg(feature = "http")]
mod http;
mod normalize;
mod stub;

#[cfg(feature = "http")]
pub use http::{ApiProvider, HttpBackend, HttpBackendConfig};
pub use normalize::l2_normalize_in_place;
pub use stub::{stub_vector, StubBackend};

use async_trait::async_trait;
use resilience::{BackendError, RequestContext};

#[async_trait]
pub trait Backend: Send + Sync {
    /// One vector per input, in input order.
    async fn compute_vectors(
        &self,
        ctx: &RequestContext,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Length of every vector this backend returns.
    fn dimension(&self) -> usize;

    fn name(&self) -> &str {
        "backend"
    }
}

/// Reject responses with the wrong count or width before they reach a cache.
pub(crate) fn check_response(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dimension: usize,
) -> Result<(), BackendError> {
    if vectors.len() != expected_count {
        return Err(BackendError::Malformed(format!(
            "backend returned {} vectors for {} inputs",
            vectors.len(),
            expected_count
        )));
    }
    if let Some((index, bad)) = vectors
        .iter()
        .enumerate()
        .find(|(_, vector)| vector.len() != dimension)
    {
        return Err(BackendError::Malformed(format!(
            "vector {index} has dimension {}, expected {dimension}",
            bad.len()
        )));
    }
    if vectors.iter().flatten().any(|x| !x.is_finite()) {
        return Err(BackendError::Malformed("non-finite vector component".into()));
    }
    Ok(())
}
