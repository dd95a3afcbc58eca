//! # gemini-protocol
//!
//! Wire formats spoken by the capsule server.
//!
//! This crate defines:
//! - Gemini status codes and response headers
//! - Gemini request line parsing
//! - The file management command grammar carried over mutually
//!   authenticated connections, including chunked upload framing
//! - Rendering of directory documents and management listings
//!
//! Nothing here performs I/O.

pub mod command;
pub mod listing;
pub mod request;
pub mod status;

pub use command::{parse_chunk_header, Command, CommandError, UploadLength};
pub use listing::{
    encode_segment, list_header, parse_list_count, render_directory_document, render_list_body,
    ListEntry,
};
pub use request::{GeminiRequest, RequestError};
pub use status::{ResponseHeader, Status};
