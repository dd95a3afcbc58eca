//! Content store abstraction.
//!
//! The store is the persistent side of the capsule: a tree of files and
//! directories under the virtual root. Implementations:
//! - [`FsStore`](crate::fs_store::FsStore) for hosts with a filesystem
//! - [`MemoryStore`] for tests and for targets that keep content in RAM
//!
//! All methods are synchronous to support embedded platforms. Writes go
//! through a staging handle and only become visible under their final name
//! on [`ContentStore::commit`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

use uuid::Uuid;

use crate::path::VirtualPath;

/// Opaque token that changes whenever the content behind a path changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionToken {
    modified_nanos: u128,
    size: u64,
    serial: u64,
}

impl VersionToken {
    /// Build a token from a modification time, a size and a store-specific
    /// serial (inode number, write counter, ...).
    pub fn new(modified: Option<SystemTime>, size: u64, serial: u64) -> Self {
        let modified_nanos = modified
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self {
            modified_nanos,
            size,
            serial,
        }
    }
}

/// Kind of an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata for an existing path.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub version: VersionToken,
}

/// A single directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// A file was removed.
    File,
    /// A directory tree was removed.
    Directory,
    /// Nothing existed at the path.
    AlreadyAbsent,
}

/// Handle to an in-progress staged write.
///
/// The staged bytes are invisible under `target` until the handle is
/// committed. Dropping a handle without committing or discarding it leaves
/// the staging artifact for the store to purge later.
#[derive(Debug)]
pub struct StagedWrite {
    id: Uuid,
    target: VirtualPath,
    written: u64,
}

impl StagedWrite {
    pub(crate) fn new(target: VirtualPath) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            written: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Final path the content will appear under.
    pub fn target(&self) -> &VirtualPath {
        &self.target
    }

    /// Bytes appended so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub(crate) fn record(&mut self, len: usize) {
        self.written += len as u64;
    }
}

/// Errors returned by content stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(VirtualPath),

    #[error("not a directory: {0}")]
    NotADirectory(VirtualPath),

    #[error("is a directory: {0}")]
    IsADirectory(VirtualPath),

    #[error("cannot modify the virtual root")]
    RootImmutable,

    #[error("reserved path: {0}")]
    Reserved(VirtualPath),

    #[error("unknown staged write {0}")]
    UnknownStaging(Uuid),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Trait for content storage implementations.
pub trait ContentStore: Send + Sync {
    /// Metadata for a path, `None` if nothing exists there.
    fn stat(&self, path: &VirtualPath) -> Result<Option<Stat>, StoreError>;

    /// Read a whole file.
    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>, StoreError>;

    /// Open a file for reading in slices.
    ///
    /// The reader sees one consistent version of the file even if it is
    /// replaced by a commit while the read is in progress.
    fn reader(&self, path: &VirtualPath) -> Result<Box<dyn Read + Send>, StoreError>;

    /// List a directory. Order is unspecified.
    fn list(&self, path: &VirtualPath) -> Result<Vec<DirEntry>, StoreError>;

    /// Open a staged write that will land at `path` on commit.
    fn write_staged(&self, path: &VirtualPath) -> Result<StagedWrite, StoreError>;

    /// Append bytes to a staged write.
    fn append(&self, handle: &mut StagedWrite, bytes: &[u8]) -> Result<(), StoreError>;

    /// Atomically publish a staged write under its target path, replacing
    /// any previous file. Returns the number of bytes published.
    fn commit(&self, handle: StagedWrite) -> Result<u64, StoreError>;

    /// Throw a staged write away.
    fn discard(&self, handle: StagedWrite) -> Result<(), StoreError>;

    /// Remove a file or a directory tree.
    fn delete(&self, path: &VirtualPath) -> Result<Removal, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    modified: SystemTime,
    serial: u64,
}

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<String, MemFile>,
    dirs: BTreeSet<String>,
    staged: HashMap<Uuid, Vec<u8>>,
}

/// In-memory content store.
///
/// Directories are tracked explicitly; inserting a file creates its parents.
/// Every trait call bumps an operation counter so tests can assert that a
/// request never reached storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemState>,
    serial: AtomicU64,
    operations: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a file in place directly, bypassing staging.
    ///
    /// Used to seed content and to simulate mutation from outside the server.
    pub fn insert(&self, path: &str, data: &[u8]) {
        let Ok(path) = VirtualPath::parse(path) else {
            return;
        };
        let serial = self.next_serial();
        let mut state = self.write_state();
        add_parents(&mut state, &path);
        state.files.insert(
            path.as_str().to_string(),
            MemFile {
                data: data.to_vec(),
                modified: SystemTime::now(),
                serial,
            },
        );
    }

    /// Create a directory and its parents.
    pub fn create_dir(&self, path: &str) {
        let Ok(path) = VirtualPath::parse(path) else {
            return;
        };
        let mut state = self.write_state();
        add_parents(&mut state, &path);
        if !path.is_root() {
            state.dirs.insert(path.as_str().to_string());
        }
    }

    /// Number of trait operations performed so far.
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// Number of staged writes neither committed nor discarded.
    pub fn staged_count(&self) -> usize {
        self.read_state().staged.len()
    }

    fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn touch(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, MemState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, MemState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn add_parents(state: &mut MemState, path: &VirtualPath) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.is_root() {
            break;
        }
        state.dirs.insert(dir.as_str().to_string());
        current = dir.parent();
    }
}

/// Nearest ancestor of `path` that is a file, if any.
fn file_ancestor(state: &MemState, path: &VirtualPath) -> Option<VirtualPath> {
    let mut current = path.parent();
    while let Some(dir) = current {
        if state.files.contains_key(dir.as_str()) {
            return Some(dir);
        }
        current = dir.parent();
    }
    None
}

fn is_dir(state: &MemState, key: &str) -> bool {
    key.is_empty() || state.dirs.contains(key)
}

/// Direct child name of `dir` for `key`, if `key` lies directly inside it.
fn child_of<'a>(dir: &str, key: &'a str) -> Option<&'a str> {
    let rest = if dir.is_empty() {
        key
    } else {
        key.strip_prefix(dir)?.strip_prefix('/')?
    };
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

fn inside(dir: &str, key: &str) -> bool {
    key.strip_prefix(dir)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

impl ContentStore for MemoryStore {
    fn stat(&self, path: &VirtualPath) -> Result<Option<Stat>, StoreError> {
        self.touch();
        let state = self.read_state();
        let key = path.as_str();
        if let Some(file) = state.files.get(key) {
            let size = file.data.len() as u64;
            return Ok(Some(Stat {
                kind: EntryKind::File,
                size,
                modified: Some(file.modified),
                version: VersionToken::new(Some(file.modified), size, file.serial),
            }));
        }
        if is_dir(&state, key) {
            return Ok(Some(Stat {
                kind: EntryKind::Directory,
                size: 0,
                modified: None,
                version: VersionToken::new(None, 0, 0),
            }));
        }
        Ok(None)
    }

    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>, StoreError> {
        self.touch();
        let state = self.read_state();
        match state.files.get(path.as_str()) {
            Some(file) => Ok(file.data.clone()),
            None if is_dir(&state, path.as_str()) => Err(StoreError::IsADirectory(path.clone())),
            None => Err(StoreError::NotFound(path.clone())),
        }
    }

    fn reader(&self, path: &VirtualPath) -> Result<Box<dyn Read + Send>, StoreError> {
        // A snapshot copy; later commits replace the map entry, not this buffer
        let data = self.read(path)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn list(&self, path: &VirtualPath) -> Result<Vec<DirEntry>, StoreError> {
        self.touch();
        let state = self.read_state();
        let key = path.as_str();
        if !is_dir(&state, key) {
            return if state.files.contains_key(key) {
                Err(StoreError::NotADirectory(path.clone()))
            } else {
                Err(StoreError::NotFound(path.clone()))
            };
        }

        let mut entries: Vec<DirEntry> = state
            .dirs
            .iter()
            .filter_map(|d| child_of(key, d))
            .map(|name| DirEntry {
                name: name.to_string(),
                kind: EntryKind::Directory,
                size: 0,
                modified: None,
            })
            .collect();
        entries.extend(state.files.iter().filter_map(|(k, file)| {
            child_of(key, k).map(|name| DirEntry {
                name: name.to_string(),
                kind: EntryKind::File,
                size: file.data.len() as u64,
                modified: Some(file.modified),
            })
        }));
        Ok(entries)
    }

    fn write_staged(&self, path: &VirtualPath) -> Result<StagedWrite, StoreError> {
        self.touch();
        if path.is_root() {
            return Err(StoreError::RootImmutable);
        }
        let mut state = self.write_state();
        if is_dir(&state, path.as_str()) {
            return Err(StoreError::IsADirectory(path.clone()));
        }
        if let Some(file) = file_ancestor(&state, path) {
            return Err(StoreError::NotADirectory(file));
        }
        let handle = StagedWrite::new(path.clone());
        state.staged.insert(handle.id(), Vec::new());
        Ok(handle)
    }

    fn append(&self, handle: &mut StagedWrite, bytes: &[u8]) -> Result<(), StoreError> {
        self.touch();
        let mut state = self.write_state();
        let staged = state
            .staged
            .get_mut(&handle.id())
            .ok_or(StoreError::UnknownStaging(handle.id()))?;
        staged.extend_from_slice(bytes);
        handle.record(bytes.len());
        Ok(())
    }

    fn commit(&self, handle: StagedWrite) -> Result<u64, StoreError> {
        self.touch();
        let serial = self.next_serial();
        let mut state = self.write_state();
        let data = state
            .staged
            .remove(&handle.id())
            .ok_or(StoreError::UnknownStaging(handle.id()))?;
        let target = handle.target();
        if is_dir(&state, target.as_str()) {
            return Err(StoreError::IsADirectory(target.clone()));
        }
        if let Some(file) = file_ancestor(&state, target) {
            return Err(StoreError::NotADirectory(file));
        }
        add_parents(&mut state, target);
        let len = data.len() as u64;
        state.files.insert(
            target.as_str().to_string(),
            MemFile {
                data,
                modified: SystemTime::now(),
                serial,
            },
        );
        Ok(len)
    }

    fn discard(&self, handle: StagedWrite) -> Result<(), StoreError> {
        self.touch();
        self.write_state().staged.remove(&handle.id());
        Ok(())
    }

    fn delete(&self, path: &VirtualPath) -> Result<Removal, StoreError> {
        self.touch();
        if path.is_root() {
            return Err(StoreError::RootImmutable);
        }
        let mut state = self.write_state();
        let key = path.as_str();
        if state.files.remove(key).is_some() {
            return Ok(Removal::File);
        }
        if state.dirs.remove(key) {
            state.dirs.retain(|d| !inside(key, d));
            state.files.retain(|f, _| !inside(key, f));
            return Ok(Removal::Directory);
        }
        Ok(Removal::AlreadyAbsent)
    }
}
