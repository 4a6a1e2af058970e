//! Flat-file response cache
//!
//! Layout: one JSON object per line, `{"key": "<sha256>", "response": {...}}`.
//! Writes only ever append; a later line for the same key supersedes earlier
//! ones. [`FileCache::compact`] rewrites the file with one line per live key.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{CacheKey, CacheResult, CacheStats, CachedResponse, ResponseCache};

#[derive(Debug, Serialize, Deserialize)]
struct CacheLine {
    key: CacheKey,
    response: CachedResponse,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<CacheKey, CachedResponse>,
    records: usize,
    /// The file ends in a partial line; the next append must start a new one.
    torn_tail: bool,
}

/// Response cache persisted to a JSON Lines file.
///
/// The whole file is indexed in memory on [`FileCache::open`]; lookups never
/// touch the disk.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    index: Mutex<Index>,
}

impl FileCache {
    /// Open (or create) the cache file at `path`, creating parent directories.
    ///
    /// Malformed lines are skipped with a warning so a torn final write never
    /// makes the cache unusable. A torn tail is terminated before the next
    /// append so later records stay on lines of their own.
    pub fn open(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut index = Index::default();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CacheLine>(&line) {
                    Ok(record) => {
                        index.entries.insert(record.key, record.response);
                        index.records += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping malformed cache line");
                    }
                }
            }
            index.torn_tail = !ends_with_newline(&path)?;
        }

        info!(
            path = %path.display(),
            entries = index.entries.len(),
            records = index.records,
            "response cache opened"
        );

        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file so each live key appears exactly once.
    ///
    /// The new file is written next to the old one and renamed over it.
    /// Returns the number of superseded records dropped.
    pub fn compact(&self) -> CacheResult<usize> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut keys: Vec<&CacheKey> = index.entries.keys().collect();
        keys.sort();

        let mut tmp = NamedTempFile::new_in(dir)?;
        for key in keys {
            let line = CacheLine {
                key: key.clone(),
                response: index.entries[key].clone(),
            };
            serde_json::to_writer(&mut tmp, &line)?;
            tmp.write_all(b"\n")?;
        }
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        let dropped = index.records - index.entries.len();
        index.records = index.entries.len();
        index.torn_tail = false;
        debug!(path = %self.path.display(), dropped, "response cache compacted");
        Ok(dropped)
    }

    fn append(&self, line: &CacheLine, torn_tail: bool) -> CacheResult<()> {
        let mut encoded = Vec::new();
        if torn_tail {
            encoded.push(b'\n');
        }
        serde_json::to_writer(&mut encoded, line)?;
        encoded.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&encoded)?;
        Ok(())
    }
}

fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[async_trait]
impl ResponseCache for FileCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResponse>> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        Ok(index.entries.get(key).cloned())
    }

    async fn put(&self, key: CacheKey, response: CachedResponse) -> CacheResult<()> {
        let line = CacheLine { key, response };
        // Hold the lock across the append so concurrent writers never interleave.
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        self.append(&line, index.torn_tail)?;
        index.torn_tail = false;
        index.entries.insert(line.key, line.response);
        index.records += 1;
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        Ok(CacheStats {
            entries: index.entries.len(),
            records: index.records,
        })
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        File::create(&self.path)?;
        *index = Index::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache() -> (tempfile::TempDir, FileCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path().join("cache").join("responses.jsonl")).unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::from_bytes(b"persist me");
        cache
            .put(key.clone(), CachedResponse::new("stored", "m"))
            .await
            .unwrap();

        let reopened = FileCache::open(cache.path()).unwrap();
        let hit = reopened.get(&key).await.unwrap().unwrap();
        assert_eq!(hit.text, "stored");
    }

    #[tokio::test]
    async fn later_line_wins_after_reopen() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::from_bytes(b"k");
        cache.put(key.clone(), CachedResponse::new("old", "m")).await.unwrap();
        cache.put(key.clone(), CachedResponse::new("new", "m")).await.unwrap();

        let reopened = FileCache::open(cache.path()).unwrap();
        assert_eq!(reopened.get(&key).await.unwrap().unwrap().text, "new");
        let stats = reopened.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.records, 2);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (_dir, cache) = make_cache();
        let key = CacheKey::from_bytes(b"good");
        cache.put(key.clone(), CachedResponse::new("ok", "m")).await.unwrap();

        let mut file = OpenOptions::new().append(true).open(cache.path()).unwrap();
        file.write_all(b"{\"key\": \"truncated\n\n").unwrap();

        let reopened = FileCache::open(cache.path()).unwrap();
        assert_eq!(reopened.stats().await.unwrap().entries, 1);
        assert!(reopened.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn append_after_torn_tail_starts_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.jsonl");
        std::fs::write(&path, b"{\"key\": \"abc").unwrap();

        let cache = FileCache::open(&path).unwrap();
        let fresh = CacheKey::from_bytes(b"fresh");
        cache.put(fresh.clone(), CachedResponse::new("kept", "m")).await.unwrap();
        let second = CacheKey::from_bytes(b"second");
        cache.put(second.clone(), CachedResponse::new("also kept", "m")).await.unwrap();

        let reopened = FileCache::open(&path).unwrap();
        assert_eq!(reopened.get(&fresh).await.unwrap().unwrap().text, "kept");
        assert_eq!(reopened.get(&second).await.unwrap().unwrap().text, "also kept");
        assert_eq!(reopened.stats().await.unwrap().entries, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn compact_drops_superseded_records() {
        let (_dir, cache) = make_cache();
        let a = CacheKey::from_bytes(b"a");
        let b = CacheKey::from_bytes(b"b");
        cache.put(a.clone(), CachedResponse::new("a1", "m")).await.unwrap();
        cache.put(a.clone(), CachedResponse::new("a2", "m")).await.unwrap();
        cache.put(b.clone(), CachedResponse::new("b1", "m")).await.unwrap();

        let dropped = cache.compact().unwrap();
        assert_eq!(dropped, 1);

        let contents = fs::read_to_string(cache.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let reopened = FileCache::open(cache.path()).unwrap();
        assert_eq!(reopened.get(&a).await.unwrap().unwrap().text, "a2");
        assert_eq!(reopened.get(&b).await.unwrap().unwrap().text, "b1");
    }

    #[tokio::test]
    async fn clear_truncates_file() {
        let (_dir, cache) = make_cache();
        cache
            .put(CacheKey::from_bytes(b"x"), CachedResponse::new("x", "m"))
            .await
            .unwrap();
        cache.clear().await.unwrap();

        assert_eq!(fs::read_to_string(cache.path()).unwrap(), "");
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }

    #[test]
    fn open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path().join("absent.jsonl")).unwrap();
        assert!(!cache.path().exists());
    }
}
