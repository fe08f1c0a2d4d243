//! Cache keys and entries shared by every tier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Content-derived cache key: 64-bit fxhash of the normalized text, as
/// 16 lowercase hex digits.
///
/// Normalization collapses runs of Unicode whitespace into one space and trims
/// both ends; case is preserved. The hash is stable across processes, so keys
/// written by one instance are readable by another through L2.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_text(text: &str) -> Self {
        let normalized = normalize_text(text);
        CacheKey(format!("{:016x}", fxhash::hash64(normalized.as_bytes())))
    }

    /// Wrap an already-computed key (e.g. read back from a store).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        CacheKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whitespace normalization applied before hashing.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Storage type of a cached vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    #[default]
    F32,
    I8,
    I16,
}

impl Dtype {
    /// Largest magnitude a quantized component may take. `None` for `F32`.
    pub fn levels(self) -> Option<f32> {
        match self {
            Dtype::F32 => None,
            Dtype::I8 => Some(i8::MAX as f32),
            Dtype::I16 => Some(i16::MAX as f32),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::F32 => "f32",
            Dtype::I8 => "i8",
            Dtype::I16 => "i16",
        };
        f.write_str(name)
    }
}

/// Stored vector components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
}

impl Payload {
    pub fn dtype(&self) -> Dtype {
        match self {
            Payload::F32(_) => Dtype::F32,
            Payload::I8(_) => Dtype::I8,
            Payload::I16(_) => Dtype::I16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::F32(v) => v.len(),
            Payload::I8(v) => v.len(),
            Payload::I16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One cached vector plus bookkeeping.
///
/// `expires_at_ms` is either `None` or strictly after `created_at_ms`. An
/// expired entry is treated as absent by every read path even before it is
/// physically removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Payload,
    pub scale: f32,
    pub dtype: Dtype,
    /// Unix milliseconds.
    pub created_at_ms: u64,
    /// Unix milliseconds, `None` for no expiry.
    pub expires_at_ms: Option<u64>,
    pub access_count: u64,
    pub tags: BTreeSet<String>,
    /// Pinned entries are never chosen for LRU eviction.
    #[serde(default)]
    pub pinned: bool,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Payload, scale: f32, ttl: Option<Duration>) -> Self {
        let created_at_ms = now_millis();
        let expires_at_ms = ttl
            .map(|ttl| created_at_ms.saturating_add((ttl.as_millis() as u64).max(1)));
        Self {
            key,
            dtype: payload.dtype(),
            payload,
            scale,
            created_at_ms,
            expires_at_ms,
            access_count: 0,
            tags: BTreeSet::new(),
            pinned: false,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Record a read.
    pub fn touch(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
    }

    pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().any(|tag| self.tags.contains(tag.as_ref()))
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
