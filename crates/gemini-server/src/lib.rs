//! # gemini-server
//!
//! Gemini capsule server with pluggable async runtime.
//!
//! A connection is served in two layers:
//! - The dispatcher accepts sockets, runs the TLS handshake and enforces the
//!   connection limit and deadlines
//! - The connection reads one request line and routes it either to the
//!   Gemini handler or, for authorized client certificates, to the file
//!   management session
//!
//! Enable features based on target platform:
//! - `tokio-runtime` (default) - For Linux/desktop

pub mod context;
pub mod error;
pub mod gemini;
pub mod tls;

#[cfg(feature = "tokio-runtime")]
pub mod connection;
#[cfg(feature = "tokio-runtime")]
pub mod dispatcher;
#[cfg(feature = "tokio-runtime")]
pub mod manage;
#[cfg(feature = "tokio-runtime")]
mod wire;

pub use context::ServerContext;
pub use error::{ServerError, TimeoutKind};
pub use gemini::{handle_request, Body, Response};
pub use tls::{ClientIdentity, TlsSessionManager, TlsState};

#[cfg(feature = "tokio-runtime")]
pub use connection::{establish, Connection, ConnectionInfo, Grammar, Phase};
#[cfg(feature = "tokio-runtime")]
pub use dispatcher::{Dispatcher, ShutdownHandle};
#[cfg(feature = "tokio-runtime")]
pub use manage::{ManagementSession, UploadSession, UploadState};

pub use gemini_core::{ContentStore, FsStore, MemoryStore, ServerConfig};
