//! Similarity tier: find a cached vector close enough to a probe vector.
//!
//! Two implementations share one contract: [`LinearScanIndex`] is exact,
//! [`HnswIndex`] (feature `hnsw`) is approximate but re-scores every candidate
//! with exact cosine, so both agree on what counts as a hit above threshold.

mod linear;
#[cfg(feature = "hnsw")]
mod hnsw;

pub use linear::LinearScanIndex;
#[cfg(feature = "hnsw")]
pub use hnsw::{HnswIndex, HnswParams};

use std::collections::BTreeSet;

use crate::entry::{now_millis, CacheKey};
use crate::error::CacheError;

/// A vector held by the semantic tier.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticRecord {
    pub key: CacheKey,
    pub text: String,
    pub vector: Vec<f32>,
    pub tags: BTreeSet<String>,
    pub expires_at_ms: Option<u64>,
}

impl SemanticRecord {
    pub fn is_live_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| now_ms < at)
    }
}

/// A search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMatch {
    pub key: CacheKey,
    pub text: String,
    pub vector: Vec<f32>,
    pub similarity: f32,
}

pub trait SemanticIndex: Send + Sync {
    /// Add or replace the record for `record.key`. A full index drops its
    /// oldest record first.
    fn add(&self, record: SemanticRecord) -> Result<(), CacheError>;

    /// Up to `k` live records, most similar first.
    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<SemanticMatch>, CacheError>;

    /// Best match with cosine similarity `>= threshold`, if any.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Option<SemanticMatch>, CacheError> {
        Ok(self
            .nearest(query, k.max(1))?
            .into_iter()
            .next()
            .filter(|best| best.similarity >= threshold))
    }

    /// Drop every record for which `doomed` returns true; returns how many.
    fn remove_where(&self, doomed: &dyn Fn(&SemanticRecord) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str;

    /// Physically drop expired records.
    fn purge_expired(&self) -> usize {
        let now = now_millis();
        self.remove_where(&|record: &SemanticRecord| !record.is_live_at(now))
    }
}

/// Exact cosine similarity; 0 when either side has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

pub(crate) fn check_dimension(expected: usize, got: usize) -> Result<(), CacheError> {
    if expected != got {
        return Err(CacheError::DimensionMismatch { expected, got });
    }
    Ok(())
}

pub(crate) fn sort_matches(matches: &mut [SemanticMatch]) {
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
