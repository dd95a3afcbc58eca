//! State shared by every connection.

use std::sync::{Arc, Mutex, MutexGuard};

use gemini_core::{ContentCache, ContentStore, MimeTable, PathResolver, ServerConfig};

/// Everything a connection needs besides its own socket.
///
/// The cache lock is only ever taken inside synchronous code, never across
/// an `.await`.
pub struct ServerContext {
    pub config: ServerConfig,
    pub store: Arc<dyn ContentStore>,
    pub resolver: PathResolver,
    pub mimes: MimeTable,
    cache: Mutex<ContentCache>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, store: Arc<dyn ContentStore>) -> Self {
        let mimes = MimeTable::new(&config.mime_types);
        let cache = ContentCache::new(&config.cache);
        Self {
            resolver: PathResolver::new(store.clone()),
            store,
            mimes,
            cache: Mutex::new(cache),
            config,
        }
    }

    /// Lock the content cache.
    pub fn cache(&self) -> MutexGuard<'_, ContentCache> {
        // Cache entries are self-validating, so a poisoned lock is still usable
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
