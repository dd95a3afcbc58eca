//! File management command grammar.
//!
//! Commands are single lines sent over a mutually authenticated connection:
//!
//! ```text
//! LIST <path>
//! DELETE <path>
//! UPLOAD <path> <length>
//! UPLOAD <path> CHUNKED
//! QUIT
//! ```
//!
//! Paths use the same percent-encoding as Gemini URIs, so a name with a
//! space is sent as `%20`. A chunked upload is followed by chunks, each a
//! decimal length line and that many bytes; a zero length ends the upload.

use crate::status::Status;

const VERBS: [&str; 4] = ["LIST", "DELETE", "UPLOAD", "QUIT"];

/// How much data follows an `UPLOAD` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLength {
    /// Exactly this many bytes follow.
    Exact(u64),
    /// Length-prefixed chunks follow, terminated by a zero-length chunk.
    Chunked,
}

/// A management command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List { path: String },
    Delete { path: String },
    Upload { path: String, length: UploadLength },
    Quit,
}

/// Errors in a command line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownVerb(String),

    #[error("missing {0}")]
    MissingArgument(&'static str),

    #[error("unexpected argument '{0}'")]
    TrailingArgument(String),

    #[error("invalid length '{0}'")]
    InvalidLength(String),

    #[error("chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: u64, max: usize },
}

impl CommandError {
    pub fn status(&self) -> Status {
        Status::BadRequest
    }
}

impl Command {
    /// Whether `line` starts with a management verb.
    ///
    /// Gemini request lines always start with a URI scheme, so the two
    /// grammars never overlap.
    pub fn is_command(line: &str) -> bool {
        let verb = line.split(' ').next().unwrap_or_default();
        VERBS.contains(&verb)
    }

    /// Parse a command line (CRLF removed).
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut parts = line.split(' ');
        let verb = parts.next().filter(|v| !v.is_empty()).ok_or(CommandError::Empty)?;

        let command = match verb {
            "LIST" => Command::List {
                path: required(parts.next(), "path")?,
            },
            "DELETE" => Command::Delete {
                path: required(parts.next(), "path")?,
            },
            "UPLOAD" => {
                let path = required(parts.next(), "path")?;
                let length = required(parts.next(), "length")?;
                let length = if length == "CHUNKED" {
                    UploadLength::Chunked
                } else {
                    UploadLength::Exact(parse_decimal(&length)?)
                };
                Command::Upload { path, length }
            }
            "QUIT" => Command::Quit,
            other => return Err(CommandError::UnknownVerb(other.to_string())),
        };

        match parts.next() {
            Some(extra) => Err(CommandError::TrailingArgument(extra.to_string())),
            None => Ok(command),
        }
    }

    /// Wire form without CRLF.
    pub fn to_line(&self) -> String {
        match self {
            Command::List { path } => format!("LIST {}", path),
            Command::Delete { path } => format!("DELETE {}", path),
            Command::Upload {
                path,
                length: UploadLength::Exact(len),
            } => format!("UPLOAD {} {}", path, len),
            Command::Upload {
                path,
                length: UploadLength::Chunked,
            } => format!("UPLOAD {} CHUNKED", path),
            Command::Quit => "QUIT".to_string(),
        }
    }

    /// Whether the command changes storage.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Command::Delete { .. } | Command::Upload { .. })
    }
}

fn required(part: Option<&str>, what: &'static str) -> Result<String, CommandError> {
    part.filter(|p| !p.is_empty())
        .map(str::to_string)
        .ok_or(CommandError::MissingArgument(what))
}

fn parse_decimal(text: &str) -> Result<u64, CommandError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CommandError::InvalidLength(text.to_string()));
    }
    text.parse()
        .map_err(|_| CommandError::InvalidLength(text.to_string()))
}

/// Parse a chunk header line (CRLF removed), enforcing the chunk size cap.
pub fn parse_chunk_header(line: &str, max: usize) -> Result<usize, CommandError> {
    let size = parse_decimal(line.trim_end())?;
    if size > max as u64 {
        return Err(CommandError::ChunkTooLarge { size, max });
    }
    Ok(size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("LIST /").unwrap(),
            Command::List { path: "/".into() }
        );
        assert_eq!(
            Command::parse("DELETE /docs/a.gmi").unwrap(),
            Command::Delete {
                path: "/docs/a.gmi".into()
            }
        );
        assert_eq!(
            Command::parse("UPLOAD /a.gmi 12").unwrap(),
            Command::Upload {
                path: "/a.gmi".into(),
                length: UploadLength::Exact(12)
            }
        );
        assert_eq!(
            Command::parse("UPLOAD /a.gmi CHUNKED").unwrap(),
            Command::Upload {
                path: "/a.gmi".into(),
                length: UploadLength::Chunked
            }
        );
        assert_eq!(Command::parse("QUIT").unwrap(), Command::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse(""), Err(CommandError::Empty));
        assert_eq!(
            Command::parse("MOVE /a /b"),
            Err(CommandError::UnknownVerb("MOVE".into()))
        );
        assert_eq!(
            Command::parse("LIST"),
            Err(CommandError::MissingArgument("path"))
        );
        assert_eq!(
            Command::parse("UPLOAD /a.gmi"),
            Err(CommandError::MissingArgument("length"))
        );
        assert_eq!(
            Command::parse("UPLOAD /a.gmi -5"),
            Err(CommandError::InvalidLength("-5".into()))
        );
        assert_eq!(
            Command::parse("DELETE /a /b"),
            Err(CommandError::TrailingArgument("/b".into()))
        );
        assert_eq!(
            Command::parse("LIST  /"),
            Err(CommandError::MissingArgument("path"))
        );
    }

    #[test]
    fn test_is_command() {
        assert!(Command::is_command("LIST /"));
        assert!(Command::is_command("QUIT"));
        assert!(!Command::is_command("gemini://host/LIST"));
        assert!(!Command::is_command("list /"));
    }

    #[test]
    fn test_to_line() {
        let cmd = Command::parse("UPLOAD /my%20file.txt CHUNKED").unwrap();
        assert_eq!(cmd.to_line(), "UPLOAD /my%20file.txt CHUNKED");
        assert!(cmd.is_mutation());
        assert!(!Command::parse("LIST /").unwrap().is_mutation());
    }

    #[test]
    fn test_chunk_header() {
        assert_eq!(parse_chunk_header("512", 4096), Ok(512));
        assert_eq!(parse_chunk_header("0", 4096), Ok(0));
        assert_eq!(
            parse_chunk_header("8192", 4096),
            Err(CommandError::ChunkTooLarge {
                size: 8192,
                max: 4096
            })
        );
        assert!(parse_chunk_header("x10", 4096).is_err());
        assert!(parse_chunk_header("", 4096).is_err());
        assert!(parse_chunk_header("99999999999999999999999", 4096).is_err());
    }
}
