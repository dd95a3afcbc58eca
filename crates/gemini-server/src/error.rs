//! Server error taxonomy.
//!
//! Every failure is scoped to one connection. [`ServerError::status`] says
//! which response, if any, can still be sent before the connection closes.

use gemini_core::{ConfigError, Rejection, StoreError};
use gemini_protocol::{CommandError, RequestError, Status};

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Handshake,
    Idle,
    Total,
}

/// Errors raised while serving a connection.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Malformed request line, command or chunk framing.
    #[error("protocol error: {0}")]
    ProtocolSyntax(String),

    /// Path traversal or a missing/unauthorized client certificate.
    #[error("security rejection: {reason}")]
    Security { status: Status, reason: String },

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("{0:?} timeout")]
    Timeout(TimeoutKind),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The peer closed the connection before a request or transfer finished.
    #[error("client closed the connection")]
    ClientAbort,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServerError {
    /// Status to send for this error, `None` when no response is possible.
    pub fn status(&self) -> Option<Status> {
        match self {
            ServerError::ProtocolSyntax(_) => Some(Status::BadRequest),
            ServerError::Security { status, .. } => Some(*status),
            ServerError::Storage(StoreError::NotFound(_)) => Some(Status::NotFound),
            ServerError::Storage(
                StoreError::NotADirectory(_)
                | StoreError::IsADirectory(_)
                | StoreError::RootImmutable
                | StoreError::Reserved(_),
            ) => Some(Status::BadRequest),
            ServerError::Storage(_) => Some(Status::TemporaryFailure),
            _ => None,
        }
    }

    /// Meta text for the error response. I/O details stay in the log.
    pub fn meta(&self) -> String {
        match self {
            ServerError::Security { reason, .. } => reason.clone(),
            ServerError::ProtocolSyntax(reason) => reason.clone(),
            ServerError::Storage(StoreError::Io { .. }) => {
                Status::TemporaryFailure.default_meta().to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether the stream is still usable after responding to this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ServerError::Storage(_) | ServerError::Security { .. })
    }

    pub(crate) fn rejected(rejection: Rejection) -> Self {
        ServerError::Security {
            status: Status::BadRequest,
            reason: rejection.to_string(),
        }
    }
}

impl From<CommandError> for ServerError {
    fn from(e: CommandError) -> Self {
        ServerError::ProtocolSyntax(e.to_string())
    }
}

impl From<RequestError> for ServerError {
    fn from(e: RequestError) -> Self {
        ServerError::ProtocolSyntax(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini_core::VirtualPath;

    #[test]
    fn test_status_mapping() {
        let syntax = ServerError::from(CommandError::Empty);
        assert_eq!(syntax.status(), Some(Status::BadRequest));
        assert!(!syntax.is_recoverable());

        let missing = ServerError::from(StoreError::NotFound(VirtualPath::root()));
        assert_eq!(missing.status(), Some(Status::NotFound));
        assert!(missing.is_recoverable());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let failed = ServerError::from(StoreError::Io {
            path: "/a".into(),
            source: io,
        });
        assert_eq!(failed.status(), Some(Status::TemporaryFailure));
        assert_eq!(failed.meta(), "Temporary failure");

        let root = ServerError::from(StoreError::RootImmutable);
        assert_eq!(root.status(), Some(Status::BadRequest));

        let security = ServerError::rejected(Rejection::ParentSegment);
        assert_eq!(security.status(), Some(Status::BadRequest));

        assert_eq!(ServerError::Timeout(TimeoutKind::Idle).status(), None);
        assert_eq!(ServerError::ClientAbort.status(), None);
    }
}
