//! # gemini-core
//!
//! Core content model for the Gemini capsule server.
//!
//! This crate provides:
//! - The content store abstraction (filesystem and in-memory implementations)
//! - Path resolution with traversal protection
//! - Extension to MIME type classification
//! - A version-checked, byte-bounded LRU content cache
//! - Server configuration types
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! making it usable on both Linux (tokio) and microcontroller targets.

pub mod cache;
pub mod config;
pub mod fs_store;
pub mod mime;
pub mod path;
pub mod store;

pub use cache::{CacheStats, Content, ContentCache};
pub use config::{
    CacheConfig, ClientAuthMode, ConfigError, Limits, ListenerConfig, ServerConfig, TlsConfig,
};
pub use fs_store::FsStore;
pub use mime::MimeTable;
pub use path::{PathKind, PathResolver, Rejection, ResolveError, ResolvedPath, VirtualPath};
pub use store::{
    ContentStore, DirEntry, EntryKind, MemoryStore, Removal, StagedWrite, Stat, StoreError,
    VersionToken,
};
