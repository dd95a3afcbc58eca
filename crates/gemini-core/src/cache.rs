//! Read-through content cache.
//!
//! Entries are keyed by [`VirtualPath`] and bounded by total bytes, evicted
//! least-recently-used first. Every lookup compares the entry's version token
//! with the token storage reported when the path was resolved, so content
//! replaced behind the server's back is re-read rather than served stale.

use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use tracing::debug;

use crate::config::CacheConfig;
use crate::mime::MimeTable;
use crate::path::{ResolvedPath, VirtualPath};
use crate::store::{ContentStore, StoreError, VersionToken};

/// File content ready to be served.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub body: Arc<[u8]>,
    pub mime: Arc<str>,
    pub version: VersionToken,
}

#[derive(Debug)]
struct CacheEntry {
    content: Content,
    last_access: Instant,
}

/// Running counters, mostly for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because storage reported a newer version.
    pub stale: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
}

/// Byte-bounded LRU cache over a content store.
pub struct ContentCache {
    entries: LruCache<VirtualPath, CacheEntry>,
    enabled: bool,
    capacity_bytes: usize,
    max_entry_bytes: usize,
    used_bytes: usize,
    stats: CacheStats,
}

impl ContentCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: LruCache::unbounded(),
            enabled: config.enabled,
            capacity_bytes: config.capacity_bytes,
            max_entry_bytes: config.max_entry_bytes.min(config.capacity_bytes),
            used_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    /// Whether a file of `size` bytes would be kept after a read.
    pub fn admits(&self, size: u64) -> bool {
        self.enabled && size <= self.max_entry_bytes as u64
    }

    /// Fetch a file's content, reading through to storage on a miss or when
    /// the cached version no longer matches `resolved.version`.
    pub fn get(
        &mut self,
        store: &dyn ContentStore,
        resolved: &ResolvedPath,
        mimes: &MimeTable,
    ) -> Result<Content, StoreError> {
        let path = &resolved.path;
        if !resolved.is_file() {
            return Err(StoreError::NotFound(path.clone()));
        }
        let version = resolved
            .version
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;

        if let Some(entry) = self.entries.get_mut(path) {
            if entry.content.version == version {
                entry.last_access = Instant::now();
                self.stats.hits += 1;
                return Ok(entry.content.clone());
            }
            debug!(path = %path, "cached entry is stale");
            self.stats.stale += 1;
            self.remove(path);
        }

        self.stats.misses += 1;
        let body = match store.read(path) {
            Ok(body) => body,
            Err(e) => {
                self.remove(path);
                return Err(e);
            }
        };

        let content = Content {
            mime: Arc::from(mimes.resolve(path.as_str())),
            body: Arc::from(body),
            version,
        };

        // A length mismatch means the file changed between stat and read;
        // serve what was read but do not pin it under the old token.
        if content.body.len() as u64 == resolved.size && self.admits(resolved.size) {
            self.insert(path.clone(), content.clone());
        }
        Ok(content)
    }

    /// Drop the entry for `path`, if any.
    pub fn invalidate(&mut self, path: &VirtualPath) -> bool {
        let removed = self.remove(path);
        if removed {
            debug!(path = %path, "cache entry invalidated");
        }
        removed
    }

    /// Drop every entry.
    pub fn invalidate_all(&mut self) {
        debug!(entries = self.entries.len(), "cache cleared");
        self.entries.clear();
        self.used_bytes = 0;
    }

    pub fn contains(&self, path: &VirtualPath) -> bool {
        self.entries.contains(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn insert(&mut self, path: VirtualPath, content: Content) {
        let size = content.body.len();
        while self.used_bytes + size > self.capacity_bytes {
            match self.entries.pop_lru() {
                Some((evicted, entry)) => {
                    self.used_bytes -= entry.content.body.len();
                    self.stats.evictions += 1;
                    debug!(path = %evicted, "cache entry evicted");
                }
                None => break,
            }
        }
        self.used_bytes += size;
        self.entries.put(
            path,
            CacheEntry {
                content,
                last_access: Instant::now(),
            },
        );
    }

    fn remove(&mut self, path: &VirtualPath) -> bool {
        match self.entries.pop(path) {
            Some(entry) => {
                self.used_bytes -= entry.content.body.len();
                true
            }
            None => false,
        }
    }
}
