//! Directory documents and management listings.
//!
//! Two renderings of the same storage listing:
//! - a Gemini document with one link line per entry, for browsing
//! - `LIST` response lines (`<f|d> <size> <modified> <name>`), for tools

use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use gemini_core::{DirEntry, EntryKind, VirtualPath};

use crate::status::{ResponseHeader, Status};

/// Characters escaped in a link path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Entries that can be shown, sorted by name.
fn visible(entries: &[DirEntry]) -> Vec<&DirEntry> {
    let mut shown: Vec<&DirEntry> = entries
        .iter()
        .filter(|e| !e.name.chars().any(char::is_control))
        .collect();
    shown.sort_by(|a, b| a.name.cmp(&b.name));
    shown
}

/// Percent-encode an entry name for use in a link.
pub fn encode_segment(name: &str) -> String {
    utf8_percent_encode(name, SEGMENT).to_string()
}

/// Render a Gemini document linking every entry of `dir`.
pub fn render_directory_document(dir: &VirtualPath, entries: &[DirEntry]) -> String {
    let base: String = dir
        .segments()
        .iter()
        .map(|s| format!("/{}", encode_segment(s)))
        .collect();

    let mut doc = format!("# Index of {}\n\n", display_dir(dir));
    if let Some(parent) = dir.parent() {
        let parent_link: String = parent
            .segments()
            .iter()
            .map(|s| format!("/{}", encode_segment(s)))
            .collect();
        doc.push_str(&format!("=> {}/ ..\n", parent_link));
    }
    for entry in visible(entries) {
        let slash = if entry.kind == EntryKind::Directory { "/" } else { "" };
        doc.push_str(&format!(
            "=> {}/{}{} {}{}\n",
            base,
            encode_segment(&entry.name),
            slash,
            entry.name,
            slash
        ));
    }
    doc
}

fn display_dir(dir: &VirtualPath) -> String {
    if dir.is_root() {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

/// One line of a `LIST` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub name: String,
}

impl ListEntry {
    pub fn from_dir_entry(entry: &DirEntry) -> Self {
        Self {
            kind: entry.kind,
            size: entry.size,
            modified: entry.modified.map(DateTime::<Utc>::from),
            name: entry.name.clone(),
        }
    }

    /// Wire form without CRLF.
    pub fn to_line(&self) -> String {
        let kind = match self.kind {
            EntryKind::File => 'f',
            EntryKind::Directory => 'd',
        };
        let modified = self
            .modified
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "-".to_string());
        format!("{} {} {} {}", kind, self.size, modified, self.name)
    }

    /// Parse a listing line (CRLF removed), as a management client would.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, ' ');
        let kind = match parts.next()? {
            "f" => EntryKind::File,
            "d" => EntryKind::Directory,
            _ => return None,
        };
        let size = parts.next()?.parse().ok()?;
        let modified = match parts.next()? {
            "-" => None,
            text => Some(DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&Utc)),
        };
        let name = parts.next()?.to_string();
        Some(Self {
            kind,
            size,
            modified,
            name,
        })
    }
}

/// Header for a `LIST` response carrying `count` entry lines.
pub fn list_header(count: usize) -> ResponseHeader {
    ResponseHeader::new(Status::Success, format!("{} entries", count))
}

/// Render a complete `LIST` response: header plus one CRLF line per entry.
pub fn render_list_body(entries: &[DirEntry]) -> String {
    let shown = visible(entries);
    let mut out = list_header(shown.len()).to_string();
    for entry in shown {
        out.push_str(&ListEntry::from_dir_entry(entry).to_line());
        out.push_str("\r\n");
    }
    out
}

/// Entry count announced by a `LIST` header meta such as `3 entries`.
pub fn parse_list_count(meta: &str) -> Option<usize> {
    meta.strip_suffix(" entries")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, SystemTime};

    fn entries() -> Vec<DirEntry> {
        vec![
            DirEntry {
                name: "index.gmi".into(),
                kind: EntryKind::File,
                size: 7,
                modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            },
            DirEntry {
                name: "docs".into(),
                kind: EntryKind::Directory,
                size: 0,
                modified: None,
            },
            DirEntry {
                name: "my notes.txt".into(),
                kind: EntryKind::File,
                size: 3,
                modified: None,
            },
        ]
    }

    #[test]
    fn test_root_document() {
        let doc = render_directory_document(&VirtualPath::root(), &entries());
        assert_eq!(
            doc,
            "# Index of /\n\n\
             => /docs/ docs/\n\
             => /index.gmi index.gmi\n\
             => /my%20notes.txt my notes.txt\n"
        );
    }

    #[test]
    fn test_nested_document_links_parent() {
        let dir = VirtualPath::parse("/docs/sub dir").unwrap();
        let doc = render_directory_document(&dir, &[]);
        assert_eq!(doc, "# Index of /docs/sub dir/\n\n=> /docs/ ..\n");
    }

    #[test]
    fn test_list_body() {
        let body = render_list_body(&entries());
        assert_eq!(
            body,
            "20 3 entries\r\n\
             d 0 - docs\r\n\
             f 7 2023-11-14T22:13:20Z index.gmi\r\n\
             f 3 - my notes.txt\r\n"
        );
    }

    #[test]
    fn test_list_entry_parse() {
        let entry = ListEntry::parse("f 7 2023-11-14T22:13:20Z my notes.txt").unwrap();
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, 7);
        assert_eq!(entry.name, "my notes.txt");
        assert!(entry.modified.is_some());
        assert_eq!(entry.to_line(), "f 7 2023-11-14T22:13:20Z my notes.txt");

        assert!(ListEntry::parse("x 1 - bad").is_none());
        assert_eq!(parse_list_count("3 entries"), Some(3));
        assert_eq!(parse_list_count("deleted"), None);
    }

    #[test]
    fn test_control_names_hidden() {
        let mut all = entries();
        all.push(DirEntry {
            name: "evil\nname".into(),
            kind: EntryKind::File,
            size: 1,
            modified: None,
        });
        assert!(render_list_body(&all).starts_with("20 3 entries\r\n"));
    }
}
