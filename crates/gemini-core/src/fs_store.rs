//! Filesystem-backed content store.
//!
//! Content lives under a root directory. Uploads are staged in
//! `<root>/.staging/<uuid>.part` and published with a rename, so a reader
//! sees either the old file or the complete new one. The staging directory
//! is hidden from every lookup and purged when the store opens.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::path::VirtualPath;
use crate::store::{ContentStore, DirEntry, EntryKind, Removal, StagedWrite, Stat, StoreError, VersionToken};

/// Name of the staging directory below the root.
pub const STAGING_DIR: &str = ".staging";

/// Content store over a local directory tree.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    staging: PathBuf,
}

impl FsStore {
    /// Open the store rooted at `root`, creating the staging area and
    /// removing artifacts left behind by an interrupted upload.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let meta = fs::metadata(&root).map_err(|e| StoreError::io(root.display(), e))?;
        if !meta.is_dir() {
            return Err(StoreError::io(
                root.display(),
                io::Error::new(io::ErrorKind::InvalidInput, "content root is not a directory"),
            ));
        }

        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|e| StoreError::io(staging.display(), e))?;
        let store = Self { root, staging };
        store.purge_staging();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn purge_staging(&self) {
        let Ok(entries) = fs::read_dir(&self.staging) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "purged stale staging file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to purge staging file"),
            }
        }
    }

    fn is_reserved(path: &VirtualPath) -> bool {
        path.segments().first().map(String::as_str) == Some(STAGING_DIR)
    }

    /// Map a virtual path onto the filesystem, refusing anything outside the root.
    fn to_fs(&self, path: &VirtualPath) -> Result<PathBuf, StoreError> {
        let mut full = self.root.clone();
        for segment in path.segments() {
            full.push(segment);
        }
        if !full.starts_with(&self.root) {
            return Err(StoreError::Reserved(path.clone()));
        }
        Ok(full)
    }

    /// Nearest ancestor of `path` that exists as a regular file.
    fn file_ancestor(&self, path: &VirtualPath) -> Option<VirtualPath> {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.is_root() {
                return None;
            }
            if self.to_fs(&dir).map(|full| full.is_file()).unwrap_or(false) {
                return Some(dir);
            }
            current = dir.parent();
        }
        None
    }

    fn staging_file(&self, handle: &StagedWrite) -> PathBuf {
        self.staging.join(format!("{}.part", handle.id()))
    }
}

fn is_missing(err: &io::Error) -> bool {
    // ENOTDIR: a path component is a regular file
    err.kind() == io::ErrorKind::NotFound || (cfg!(unix) && err.raw_os_error() == Some(20))
}

#[cfg(unix)]
fn serial(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn serial(_meta: &fs::Metadata) -> u64 {
    0
}

fn kind_of(meta: &fs::Metadata) -> Option<EntryKind> {
    if meta.is_dir() {
        Some(EntryKind::Directory)
    } else if meta.is_file() {
        Some(EntryKind::File)
    } else {
        None
    }
}

impl ContentStore for FsStore {
    fn stat(&self, path: &VirtualPath) -> Result<Option<Stat>, StoreError> {
        if Self::is_reserved(path) {
            return Ok(None);
        }
        let full = self.to_fs(path)?;
        let meta = match fs::metadata(&full) {
            Ok(meta) => meta,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let Some(kind) = kind_of(&meta) else {
            return Ok(None);
        };
        let size = if kind == EntryKind::File { meta.len() } else { 0 };
        let modified = meta.modified().ok();
        Ok(Some(Stat {
            kind,
            size,
            modified,
            version: VersionToken::new(modified, meta.len(), serial(&meta)),
        }))
    }

    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>, StoreError> {
        if Self::is_reserved(path) {
            return Err(StoreError::NotFound(path.clone()));
        }
        let full = self.to_fs(path)?;
        fs::read(&full).map_err(|e| match e {
            e if is_missing(&e) => StoreError::NotFound(path.clone()),
            e if full.is_dir() => StoreError::IsADirectory(path.clone()),
            e => StoreError::io(path, e),
        })
    }

    fn reader(&self, path: &VirtualPath) -> Result<Box<dyn Read + Send>, StoreError> {
        if Self::is_reserved(path) {
            return Err(StoreError::NotFound(path.clone()));
        }
        let full = self.to_fs(path)?;
        if full.is_dir() {
            return Err(StoreError::IsADirectory(path.clone()));
        }
        // An open handle keeps reading the old inode across a rename
        let file = File::open(&full).map_err(|e| {
            if is_missing(&e) {
                StoreError::NotFound(path.clone())
            } else {
                StoreError::io(path, e)
            }
        })?;
        Ok(Box::new(file))
    }

    fn list(&self, path: &VirtualPath) -> Result<Vec<DirEntry>, StoreError> {
        if Self::is_reserved(path) {
            return Err(StoreError::NotFound(path.clone()));
        }
        let full = self.to_fs(path)?;
        let reader = match fs::read_dir(&full) {
            Ok(reader) => reader,
            Err(e) if is_missing(&e) => return Err(StoreError::NotFound(path.clone())),
            Err(_) if full.is_file() => return Err(StoreError::NotADirectory(path.clone())),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|e| StoreError::io(path, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                debug!(dir = %path, "skipping entry with non UTF-8 name");
                continue;
            };
            if path.is_root() && name == STAGING_DIR {
                continue;
            }
            let meta = match fs::metadata(entry.path()) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(dir = %path, name = %name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Some(kind) = kind_of(&meta) else {
                continue;
            };
            entries.push(DirEntry {
                name,
                kind,
                size: if kind == EntryKind::File { meta.len() } else { 0 },
                modified: meta.modified().ok(),
            });
        }
        Ok(entries)
    }

    fn write_staged(&self, path: &VirtualPath) -> Result<StagedWrite, StoreError> {
        if path.is_root() {
            return Err(StoreError::RootImmutable);
        }
        if Self::is_reserved(path) {
            return Err(StoreError::Reserved(path.clone()));
        }
        let full = self.to_fs(path)?;
        if full.is_dir() {
            return Err(StoreError::IsADirectory(path.clone()));
        }
        if let Some(file) = self.file_ancestor(path) {
            return Err(StoreError::NotADirectory(file));
        }

        let handle = StagedWrite::new(path.clone());
        let staged = self.staging_file(&handle);
        File::create(&staged).map_err(|e| StoreError::io(staged.display(), e))?;
        Ok(handle)
    }

    fn append(&self, handle: &mut StagedWrite, bytes: &[u8]) -> Result<(), StoreError> {
        let staged = self.staging_file(handle);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&staged)
            .map_err(|e| {
                if is_missing(&e) {
                    StoreError::UnknownStaging(handle.id())
                } else {
                    StoreError::io(staged.display(), e)
                }
            })?;
        file.write_all(bytes)
            .map_err(|e| StoreError::io(staged.display(), e))?;
        handle.record(bytes.len());
        Ok(())
    }

    fn commit(&self, handle: StagedWrite) -> Result<u64, StoreError> {
        let staged = self.staging_file(&handle);
        let target = handle.target();
        let result = (|| {
            let full = self.to_fs(target)?;
            if full.is_dir() {
                return Err(StoreError::IsADirectory(target.clone()));
            }
            if let Some(file) = self.file_ancestor(target) {
                return Err(StoreError::NotADirectory(file));
            }
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(target, e))?;
            }
            File::open(&staged)
                .and_then(|f| f.sync_all())
                .map_err(|e| StoreError::io(staged.display(), e))?;
            fs::rename(&staged, &full).map_err(|e| StoreError::io(target, e))
        })();

        match result {
            Ok(()) => Ok(handle.written()),
            Err(e) => {
                let _ = fs::remove_file(&staged);
                Err(e)
            }
        }
    }

    fn discard(&self, handle: StagedWrite) -> Result<(), StoreError> {
        let staged = self.staging_file(&handle);
        match fs::remove_file(&staged) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(StoreError::io(staged.display(), e)),
        }
    }

    fn delete(&self, path: &VirtualPath) -> Result<Removal, StoreError> {
        if path.is_root() {
            return Err(StoreError::RootImmutable);
        }
        if Self::is_reserved(path) {
            return Ok(Removal::AlreadyAbsent);
        }
        let full = self.to_fs(path)?;
        let meta = match fs::metadata(&full) {
            Ok(meta) => meta,
            Err(e) if is_missing(&e) => return Ok(Removal::AlreadyAbsent),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&full).map_err(|e| StoreError::io(path, e))?;
            Ok(Removal::Directory)
        } else {
            match fs::remove_file(&full) {
                Ok(()) => Ok(Removal::File),
                Err(e) if is_missing(&e) => Ok(Removal::AlreadyAbsent),
                Err(e) => Err(StoreError::io(path, e)),
            }
        }
    }
}
