//! SPP response cache
//!
//! Every completion an SPP run receives can be stored under a content hash of
//! the request that produced it. Re-running a program against a warm cache
//! issues no backend calls at all.
//!
//! - [`CacheKey`]: SHA-256 digest of a canonical request encoding
//! - [`ResponseCache`]: async, backend-agnostic cache interface
//! - [`MemoryCache`]: in-process map, used by tests and short-lived runs
//! - [`FileCache`]: flat JSON Lines file, append-only with explicit compaction

pub mod error;
pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use error::{CacheError, CacheResult};
pub use file::FileCache;
pub use memory::MemoryCache;

/// Cache key (SHA-256 hex string of the request bytes).
///
/// The inner field is private so a key is always 64 lowercase hex chars,
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash arbitrary bytes into a key.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidKey(s));
        }
        Ok(CacheKey(s.to_ascii_lowercase()))
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A completion as remembered by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Raw completion text
    pub text: String,
    /// Model that produced the completion
    pub model: String,
    /// When the completion was stored
    pub created_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            created_at: Utc::now(),
        }
    }
}

/// Summary of a cache's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Distinct keys currently held
    pub entries: usize,
    /// Records on disk, including superseded ones (equals `entries` in memory)
    pub records: usize,
}

/// Completion cache.
///
/// Guarantees:
/// - `get(key)` after `put(key, r)` returns `r` until the next `put` or `clear`.
/// - A later `put` for the same key replaces the earlier response.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up a response. `Ok(None)` on a miss.
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResponse>>;

    /// Store (or replace) a response.
    async fn put(&self, key: CacheKey, response: CachedResponse) -> CacheResult<()>;

    /// Current entry/record counts.
    async fn stats(&self) -> CacheResult<CacheStats>;

    /// Drop every entry.
    async fn clear(&self) -> CacheResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_sha256_hex() {
        let a = CacheKey::from_bytes(b"prompt");
        let b = CacheKey::from_bytes(b"prompt");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn different_bytes_different_key() {
        assert_ne!(CacheKey::from_bytes(b"a"), CacheKey::from_bytes(b"b"));
    }

    #[test]
    fn key_try_from_rejects_garbage() {
        assert!(CacheKey::try_from("nope".to_string()).is_err());
        assert!(CacheKey::try_from("z".repeat(64)).is_err());
    }

    #[test]
    fn key_try_from_lowercases() {
        let key = CacheKey::from_bytes(b"x");
        let upper = key.as_str().to_ascii_uppercase();
        assert_eq!(CacheKey::try_from(upper).unwrap(), key);
    }

    #[test]
    fn key_serde_is_plain_string() {
        let key = CacheKey::from_bytes(b"serde");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.as_str()));
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<CacheKey>("\"short\"").is_err());
    }
}
