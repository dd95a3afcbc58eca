//! Extension to MIME type classification.
//!
//! The table is built once at startup and never mutated afterwards. The two
//! text types the capsule is built around are fixed; everything else comes
//! from configuration, with `application/octet-stream` as the fallback.

use std::collections::{BTreeMap, HashMap};

/// MIME type for Gemini documents.
pub const TEXT_GEMINI: &str = "text/gemini; charset=utf-8";

/// MIME type for plain text files.
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Fallback for unknown extensions.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Immutable extension to MIME type lookup table.
#[derive(Debug, Clone, Default)]
pub struct MimeTable {
    /// Configured extensions, lowercased, without the leading dot.
    extra: HashMap<String, String>,
}

impl MimeTable {
    /// Build a table from the configured extension map.
    ///
    /// Keys may be given with or without a leading dot and in any case.
    /// Entries for `gmi` and `txt` are ignored; those types are fixed.
    pub fn new(configured: &BTreeMap<String, String>) -> Self {
        let extra = configured
            .iter()
            .map(|(ext, mime)| (normalize_extension(ext), mime.clone()))
            .filter(|(ext, _)| !ext.is_empty() && builtin(ext).is_none())
            .collect();
        Self { extra }
    }

    /// Classify a file name or path by its extension.
    pub fn resolve(&self, name: &str) -> &str {
        let Some(ext) = extension(name) else {
            return OCTET_STREAM;
        };
        let ext = ext.to_ascii_lowercase();
        if let Some(mime) = builtin(&ext) {
            return mime;
        }
        self.extra
            .get(&ext)
            .map(String::as_str)
            .unwrap_or(OCTET_STREAM)
    }

    /// Number of configured (non built-in) extensions.
    pub fn len(&self) -> usize {
        self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extra.is_empty()
    }
}

fn builtin(ext: &str) -> Option<&'static str> {
    match ext {
        "gmi" => Some(TEXT_GEMINI),
        "txt" => Some(TEXT_PLAIN),
        _ => None,
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Extension of the last path segment, if it has one.
///
/// Dotfiles such as `.profile` have no extension.
fn extension(name: &str) -> Option<&str> {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rfind('.') {
        Some(0) | None => None,
        Some(idx) if idx + 1 == file.len() => None,
        Some(idx) => Some(&file[idx + 1..]),
    }
}

/// Default extension table, matching the types a small capsule usually hosts.
pub fn default_extensions() -> BTreeMap<String, String> {
    [
        ("html", "text/html"),
        ("css", "text/css"),
        ("js", "application/javascript"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("pdf", "application/pdf"),
    ]
    .into_iter()
    .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MimeTable {
        MimeTable::new(&default_extensions())
    }

    #[test]
    fn test_builtin_types() {
        let mimes = table();
        assert_eq!(mimes.resolve("index.gmi"), TEXT_GEMINI);
        assert_eq!(mimes.resolve("docs/notes.txt"), TEXT_PLAIN);
    }

    #[test]
    fn test_configured_types() {
        let mimes = table();
        assert_eq!(mimes.resolve("photo.JPG"), "image/jpeg");
        assert_eq!(mimes.resolve("paper.pdf"), "application/pdf");
    }

    #[test]
    fn test_fallback() {
        let mimes = table();
        assert_eq!(mimes.resolve("archive.tar.zst"), OCTET_STREAM);
        assert_eq!(mimes.resolve("README"), OCTET_STREAM);
        assert_eq!(mimes.resolve(".profile"), OCTET_STREAM);
        assert_eq!(mimes.resolve("trailing."), OCTET_STREAM);
    }

    #[test]
    fn test_builtins_cannot_be_overridden() {
        let mut configured = BTreeMap::new();
        configured.insert(".gmi".to_string(), "text/html".to_string());
        configured.insert(".Wasm".to_string(), "application/wasm".to_string());
        let mimes = MimeTable::new(&configured);

        assert_eq!(mimes.resolve("index.gmi"), TEXT_GEMINI);
        assert_eq!(mimes.resolve("app.wasm"), "application/wasm");
        assert_eq!(mimes.len(), 1);
    }

    #[test]
    fn test_directory_dots_are_ignored() {
        let mimes = table();
        assert_eq!(mimes.resolve("v1.2/README"), OCTET_STREAM);
    }
}
