//! embedgate cache
//!
//! Three tiers sit in front of the embedding backend, consulted in order and
//! short-circuiting on the first hit:
//!
//! 1. **L1** ([`L1Cache`]) - in-process LRU keyed by content hash, TTL checked
//!    on read, pinned entries exempt from eviction.
//! 2. **L2** ([`L2Store`]) - shared out-of-process key-value store holding
//!    bincode-encoded [`CacheEntry`] bytes. Hits are promoted into L1.
//!    [`InMemoryL2`] is always available; `RedisL2` needs the `redis` feature.
//! 3. **Semantic** ([`SemanticIndex`]) - returns a cached vector whose cosine
//!    similarity to a caller-supplied probe clears the threshold.
//!    [`LinearScanIndex`] is exact; `HnswIndex` needs the `hnsw` feature.
//!
//! Vectors may be stored quantized to `i8`/`i16` by the [`QuantizationCodec`],
//! which calibrates its scale from a rolling sample of recent vectors.
//!
//! Tier failures never surface to callers of [`CacheHierarchy`]: an
//! unreachable L2, an undecodable entry or a corrupt scale all read as a miss
//! and are counted in [`CacheStats`].

pub mod entry;
pub mod error;
pub mod hierarchy;
pub mod l1;
pub mod l2;
pub mod quantize;
pub mod semantic;

pub use crate::entry::{normalize_text, now_millis, CacheEntry, CacheKey, Dtype, Payload};
pub use crate::error::CacheError;
pub use crate::hierarchy::{
    CacheConfig, CacheHealth, CacheHierarchy, CacheLookup, CacheStats, Invalidated,
    SemanticBackend, Tier, TierHealth,
};
pub use crate::l1::{L1Cache, TierStats};
#[cfg(feature = "redis")]
pub use crate::l2::RedisL2;
pub use crate::l2::{InMemoryL2, L2Store};
pub use crate::quantize::{
    dequantize, quantize_with, QuantizationCodec, QuantizationConfig, QuantizationProfile,
    Quantized,
};
#[cfg(feature = "hnsw")]
pub use crate::semantic::{HnswIndex, HnswParams};
pub use crate::semantic::{
    cosine_similarity, LinearScanIndex, SemanticIndex, SemanticMatch, SemanticRecord,
};
