//! In-memory response cache

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{CacheKey, CacheResult, CacheStats, CachedResponse, ResponseCache};

/// Response cache backed by a `HashMap<CacheKey, CachedResponse>`.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, CachedResponse>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResponse>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: CacheKey, response: CachedResponse) -> CacheResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, response);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(CacheStats {
            entries: entries.len(),
            records: entries.len(),
        })
    }

    async fn clear(&self) -> CacheResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
