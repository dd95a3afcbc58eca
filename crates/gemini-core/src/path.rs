//! Path resolution and traversal protection.
//!
//! Every path that reaches the cache or the content store is a [`VirtualPath`],
//! and the only way to build one is through [`VirtualPath::parse`]. Parsing
//! percent-decodes each segment exactly once and rejects anything that could
//! climb out of the virtual root, so a rejected request never touches storage.
//!
//! Paths are relative to the virtual root: `""` is the root itself,
//! `"docs/notes.gmi"` a file below it.

use std::path::{Component, Path};
use std::sync::Arc;

use percent_encoding::percent_decode_str;

use crate::store::{ContentStore, EntryKind, StoreError, VersionToken};

/// A normalized path inside the virtual root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath {
    /// Canonical form, segments joined by '/', no leading or trailing slash
    raw: String,
    /// Decoded path segments
    segments: Vec<String>,
}

impl VirtualPath {
    /// The virtual root.
    pub fn root() -> Self {
        Self {
            raw: String::new(),
            segments: Vec::new(),
        }
    }

    /// Normalize a requested path, rejecting anything outside the root.
    ///
    /// Accepts an optional leading '/' and a single trailing '/' (directory
    /// marker). Each segment is percent-decoded once; a decoded segment that
    /// contains a separator, equals `..`, or is empty is rejected. `.`
    /// segments are dropped.
    pub fn parse(requested: &str) -> Result<Self, Rejection> {
        if requested.chars().any(char::is_control) {
            return Err(Rejection::ControlCharacter);
        }

        let trimmed = requested.strip_prefix('/').unwrap_or(requested);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            // "" and "/" are the root; "//" is an empty segment
            return if requested.len() <= 1 {
                Ok(Self::root())
            } else {
                Err(Rejection::EmptySegment)
            };
        }

        let mut segments = Vec::new();
        for raw in trimmed.split('/') {
            if raw.is_empty() {
                return Err(Rejection::EmptySegment);
            }
            let decoded = percent_decode_str(raw)
                .decode_utf8()
                .map_err(|_| Rejection::InvalidEncoding)?;
            match validate_segment(&decoded)? {
                Segment::Current => {}
                Segment::Name => segments.push(decoded.into_owned()),
            }
        }

        let raw = segments.join("/");
        let all_normal = Path::new(&raw)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !all_normal {
            return Err(Rejection::EscapesRoot);
        }

        Ok(Self { raw, segments })
    }

    /// Canonical relative form (empty for the root).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Decoded path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent directory, `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        let segments = self.segments[..self.segments.len() - 1].to_vec();
        Some(Self {
            raw: segments.join("/"),
            segments,
        })
    }

    /// Append a single, already decoded, entry name.
    pub fn join(&self, name: &str) -> Result<VirtualPath, Rejection> {
        if name.is_empty() {
            return Err(Rejection::EmptySegment);
        }
        if name.chars().any(char::is_control) {
            return Err(Rejection::ControlCharacter);
        }
        if validate_segment(name)? == Segment::Current {
            return Err(Rejection::EmptySegment);
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self {
            raw: segments.join("/"),
            segments,
        })
    }

    /// Segment-wise prefix check.
    pub fn starts_with(&self, prefix: &VirtualPath) -> bool {
        if prefix.segments.len() > self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(prefix.segments.iter())
            .all(|(a, b)| a == b)
    }

    /// Absolute form as used in request URIs, e.g. `/docs/notes.gmi`.
    pub fn to_absolute(&self) -> String {
        format!("/{}", self.raw)
    }
}

impl std::fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.raw)
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Current,
    Name,
}

fn validate_segment(decoded: &str) -> Result<Segment, Rejection> {
    if decoded.contains('/') || decoded.contains('\\') {
        return Err(Rejection::EncodedSeparator);
    }
    if decoded.chars().any(char::is_control) {
        return Err(Rejection::ControlCharacter);
    }
    match decoded {
        ".." => Err(Rejection::ParentSegment),
        "." => Ok(Segment::Current),
        "" => Err(Rejection::EmptySegment),
        _ => Ok(Segment::Name),
    }
}

/// Why a requested path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("parent directory segment")]
    ParentSegment,
    #[error("encoded path separator")]
    EncodedSeparator,
    #[error("empty path segment")]
    EmptySegment,
    #[error("invalid percent-encoding")]
    InvalidEncoding,
    #[error("control character in path")]
    ControlCharacter,
    #[error("path escapes the virtual root")]
    EscapesRoot,
}

/// What a resolved path refers to in the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    NotFound,
}

impl From<EntryKind> for PathKind {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => PathKind::File,
            EntryKind::Directory => PathKind::Directory,
        }
    }
}

/// A security-checked path plus what storage says about it right now.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub path: VirtualPath,
    pub kind: PathKind,
    /// Storage version token, `None` when the path does not exist.
    pub version: Option<VersionToken>,
    /// Size in bytes (0 for directories and missing paths).
    pub size: u64,
}

impl ResolvedPath {
    pub fn is_file(&self) -> bool {
        self.kind == PathKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == PathKind::Directory
    }
}

/// Failure to resolve a requested path.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The path was refused before any storage access.
    #[error("path rejected: {0}")]
    Rejected(#[from] Rejection),

    /// The path was valid but storage could not be queried.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Resolves requested paths against a content store.
#[derive(Clone)]
pub struct PathResolver {
    store: Arc<dyn ContentStore>,
}

impl PathResolver {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Normalize `requested` and classify it with a storage `stat`.
    pub fn resolve(&self, requested: &str) -> Result<ResolvedPath, ResolveError> {
        let path = VirtualPath::parse(requested)?;
        Ok(self.classify(path)?)
    }

    /// Classify an already normalized path.
    pub fn classify(&self, path: VirtualPath) -> Result<ResolvedPath, StoreError> {
        let resolved = match self.store.stat(&path)? {
            Some(stat) => ResolvedPath {
                path,
                kind: stat.kind.into(),
                version: Some(stat.version),
                size: stat.size,
            },
            None => ResolvedPath {
                path,
                kind: PathKind::NotFound,
                version: None,
                size: 0,
            },
        };
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_root_forms() {
        assert!(VirtualPath::parse("").unwrap().is_root());
        assert!(VirtualPath::parse("/").unwrap().is_root());
        assert!(VirtualPath::parse("/./").unwrap().is_root());
    }

    #[test]
    fn test_path_parsing() {
        let path = VirtualPath::parse("/docs/notes.gmi").unwrap();
        assert_eq!(path.segments(), &["docs", "notes.gmi"]);
        assert_eq!(path.as_str(), "docs/notes.gmi");
        assert_eq!(path.to_string(), "/docs/notes.gmi");
    }

    #[test]
    fn test_trailing_directory_marker() {
        let path = VirtualPath::parse("/docs/").unwrap();
        assert_eq!(path.as_str(), "docs");
    }

    #[test]
    fn test_percent_decoding_once() {
        let path = VirtualPath::parse("/my%20notes/caf%C3%A9.gmi").unwrap();
        assert_eq!(path.segments(), &["my notes", "café.gmi"]);

        // Double encoding stays literal after the single decode
        let path = VirtualPath::parse("/%252e%252e/x").unwrap();
        assert_eq!(path.segments(), &["%2e%2e", "x"]);
    }

    #[test]
    fn test_traversal_rejected() {
        assert_eq!(VirtualPath::parse("/../../etc"), Err(Rejection::ParentSegment));
        assert_eq!(VirtualPath::parse("/docs/../.."), Err(Rejection::ParentSegment));
        assert_eq!(VirtualPath::parse("/%2e%2e/etc"), Err(Rejection::ParentSegment));
        assert_eq!(VirtualPath::parse("/..%2Fetc"), Err(Rejection::EncodedSeparator));
        assert_eq!(VirtualPath::parse("/a%5C..%5Cb"), Err(Rejection::EncodedSeparator));
    }

    #[test]
    fn test_empty_segments_rejected() {
        assert_eq!(VirtualPath::parse("//etc/passwd"), Err(Rejection::EmptySegment));
        assert_eq!(VirtualPath::parse("/a//b"), Err(Rejection::EmptySegment));
        assert_eq!(VirtualPath::parse("/a/b//"), Err(Rejection::EmptySegment));
        assert_eq!(VirtualPath::parse("//"), Err(Rejection::EmptySegment));
    }

    #[test]
    fn test_bad_encoding_and_controls() {
        assert_eq!(VirtualPath::parse("/%FF"), Err(Rejection::InvalidEncoding));
        assert_eq!(VirtualPath::parse("/a%00b"), Err(Rejection::ControlCharacter));
        assert_eq!(VirtualPath::parse("/a\nb"), Err(Rejection::ControlCharacter));
    }

    #[test]
    fn test_parent_and_join() {
        let path = VirtualPath::parse("docs/a.gmi").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.as_str(), "docs");
        assert!(parent.parent().unwrap().is_root());
        assert!(VirtualPath::root().parent().is_none());

        assert_eq!(parent.join("b.gmi").unwrap().as_str(), "docs/b.gmi");
        assert_eq!(parent.join(".."), Err(Rejection::ParentSegment));
        assert_eq!(parent.join("x/y"), Err(Rejection::EncodedSeparator));
        assert!(path.starts_with(&parent));
        assert!(!parent.starts_with(&path));
    }

    #[test]
    fn test_resolve_kinds() {
        let store = Arc::new(MemoryStore::new());
        store.insert("index.gmi", b"# Hello");
        store.create_dir("docs");
        let resolver = PathResolver::new(store);

        let file = resolver.resolve("/index.gmi").unwrap();
        assert_eq!(file.kind, PathKind::File);
        assert_eq!(file.size, 7);
        assert!(file.version.is_some());

        assert_eq!(resolver.resolve("/docs/").unwrap().kind, PathKind::Directory);
        assert_eq!(resolver.resolve("/").unwrap().kind, PathKind::Directory);

        let missing = resolver.resolve("/missing.gmi").unwrap();
        assert_eq!(missing.kind, PathKind::NotFound);
        assert!(missing.version.is_none());
    }

    #[test]
    fn test_rejection_never_reaches_storage() {
        let store = Arc::new(MemoryStore::new());
        let resolver = PathResolver::new(store.clone());

        for bad in ["/../../etc", "/%2e%2e/secret", "//abs", "/a/%2F/b"] {
            assert!(matches!(
                resolver.resolve(bad),
                Err(ResolveError::Rejected(_))
            ));
        }
        assert_eq!(store.operation_count(), 0);
    }
}
