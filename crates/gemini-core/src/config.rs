//! Server configuration.
//!
//! Configuration is loaded once at startup (JSON on Linux) and passed to the
//! server by value; nothing here is consulted through globals. Every field
//! has a default so a partial file is enough.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mime::default_extensions;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Hostnames accepted in request URIs. Empty accepts any host.
    pub hostnames: Vec<String>,

    /// Virtual root directory.
    pub root: PathBuf,

    /// File served for a directory request when it exists.
    pub index_file: Option<String>,

    /// Generate a listing for directories without an index file.
    pub directory_listing: bool,

    /// Extension to MIME type table (`gmi` and `txt` are fixed).
    pub mime_types: BTreeMap<String, String>,

    pub tls: TlsConfig,

    pub listeners: Vec<ListenerConfig>,

    pub cache: CacheConfig,

    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostnames: Vec::new(),
            root: PathBuf::from("public"),
            index_file: Some("index.gmi".to_string()),
            directory_listing: true,
            mime_types: default_extensions(),
            tls: TlsConfig::default(),
            listeners: vec![ListenerConfig::default()],
            cache: CacheConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid("at least one listener is required".into()));
        }
        let limits = &self.limits;
        let sizes = [
            ("maxRequestLine", limits.max_request_line),
            ("maxChunkSize", limits.max_chunk_size),
            ("writeChunkSize", limits.write_chunk_size),
            ("readSliceSize", limits.read_slice_size),
            ("maxConnections", limits.max_connections),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("limits.{} must be non-zero", name)));
        }
        if limits.max_chunk_size as u64 > limits.max_upload_size {
            return Err(ConfigError::Invalid(
                "limits.maxChunkSize exceeds limits.maxUploadSize".into(),
            ));
        }
        if limits.idle_timeout_secs == 0 || limits.total_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        let wants_client_certs = self
            .listeners
            .iter()
            .any(|l| l.client_auth != ClientAuthMode::None);
        if wants_client_certs
            && self.tls.trust_anchor.is_none()
            && self.tls.admin_fingerprints.is_empty()
        {
            // Client certificates can be requested but never authorized.
            tracing::warn!("client certificates requested but no trust anchor or fingerprints configured");
        }
        Ok(())
    }

    /// Whether `host` may appear in a request URI.
    pub fn accepts_host(&self, host: &str) -> bool {
        self.hostnames.is_empty() || self.hostnames.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

/// Certificate material. Files may be PEM or DER.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    /// Server certificate chain.
    pub certificate: PathBuf,

    /// Server private key (PKCS#8 when DER).
    pub private_key: PathBuf,

    /// CA certificate(s) that issue administrator client certificates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_anchor: Option<PathBuf>,

    /// SHA-256 fingerprints (hex) of individually trusted client certificates.
    pub admin_fingerprints: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("certificate.der.crt"),
            private_key: PathBuf::from("private.key.der"),
            trust_anchor: None,
            admin_fingerprints: Vec::new(),
        }
    }
}

/// Whether a listener asks for client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    /// Never request a client certificate.
    None,
    /// Request one; clients without a certificate stay anonymous.
    Optional,
    /// Fail the handshake without a client certificate.
    Required,
}

/// A single listening socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    pub client_auth: ClientAuthMode,
    /// Offer the file management commands to authorized clients.
    pub management: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1965)),
            client_auth: ClientAuthMode::Optional,
            management: true,
        }
    }
}

/// Content cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Total bytes held by the cache.
    pub capacity_bytes: usize,
    /// Largest single file that is cached; larger files are streamed.
    pub max_entry_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_bytes: 64 * 1024,
            max_entry_bytes: 16 * 1024,
        }
    }
}

/// Buffer sizes and deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    /// Longest request or command line, excluding CRLF.
    pub max_request_line: usize,
    /// Largest chunk accepted in a chunked upload.
    pub max_chunk_size: usize,
    /// Largest upload accepted in either mode.
    pub max_upload_size: u64,
    /// Size of each write to the TLS stream.
    pub write_chunk_size: usize,
    /// Size of each storage read when streaming uncached files.
    pub read_slice_size: usize,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub total_timeout_secs: u64,
    /// In-flight connections; further accepts are closed immediately.
    pub max_connections: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_request_line: 1024,
            max_chunk_size: 4096,
            max_upload_size: 1024 * 1024,
            write_chunk_size: 1024,
            read_slice_size: 4096,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 15,
            total_timeout_secs: 120,
            max_connections: 8,
        }
    }
}

impl Limits {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}
