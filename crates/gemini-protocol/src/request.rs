//! Gemini request line parsing.
//!
//! A request is a single absolute URI followed by CRLF. The parser here
//! works on the line with the CRLF already removed and deliberately does not
//! normalize the path: dot segments and percent escapes are left for the
//! path guard, which rejects them before storage is touched.

use crate::status::Status;

/// A parsed Gemini request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiRequest {
    /// Host as written in the URI (brackets stripped for IPv6 literals).
    pub host: String,
    pub port: Option<u16>,
    /// Path exactly as sent, still percent-encoded. Never empty.
    pub path: String,
    /// Query component without the leading '?'.
    pub query: Option<String>,
}

/// Errors in a request line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request line exceeds {0} bytes")]
    TooLong(usize),

    #[error("request is not valid UTF-8")]
    NotUtf8,

    #[error("request must be an absolute URI")]
    NotAbsolute,

    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("user info is not allowed in Gemini URIs")]
    UserInfo,

    #[error("fragments are not allowed in requests")]
    Fragment,

    #[error("missing host")]
    MissingHost,

    #[error("invalid port")]
    InvalidPort,

    #[error("invalid character in request")]
    InvalidCharacter,

    #[error("host '{0}' is not served here")]
    HostMismatch(String),

    #[error("port {0} is not served here")]
    PortMismatch(u16),
}

impl RequestError {
    /// Response status for this error.
    pub fn status(&self) -> Status {
        match self {
            RequestError::UnsupportedScheme(_)
            | RequestError::HostMismatch(_)
            | RequestError::PortMismatch(_) => Status::ProxyRequestRefused,
            _ => Status::BadRequest,
        }
    }
}

impl GeminiRequest {
    /// Parse a request line (CRLF removed).
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        if line.chars().any(|c| c.is_control() || c == ' ' || c == '\u{feff}') {
            return Err(RequestError::InvalidCharacter);
        }

        let (scheme, rest) = line.split_once("://").ok_or(RequestError::NotAbsolute)?;
        let valid_scheme = scheme
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic())
            .unwrap_or(false)
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(RequestError::NotAbsolute);
        }
        if !scheme.eq_ignore_ascii_case("gemini") {
            return Err(RequestError::UnsupportedScheme(scheme.to_string()));
        }
        if rest.contains('#') {
            return Err(RequestError::Fragment);
        }

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, remainder) = rest.split_at(authority_end);
        if authority.contains('@') {
            return Err(RequestError::UserInfo);
        }
        let (host, port) = split_host_port(authority)?;
        if host.is_empty() {
            return Err(RequestError::MissingHost);
        }

        let (path, query) = match remainder.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (remainder, None),
        };
        let path = if path.is_empty() { "/" } else { path };

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
            query,
        })
    }

    /// Check the authority against the served host names and listener port.
    pub fn check_authority(
        &self,
        accepts_host: impl Fn(&str) -> bool,
        listener_port: u16,
    ) -> Result<(), RequestError> {
        if !accepts_host(&self.host) {
            return Err(RequestError::HostMismatch(self.host.clone()));
        }
        match self.port {
            Some(port) if port != listener_port => Err(RequestError::PortMismatch(port)),
            _ => Ok(()),
        }
    }
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), RequestError> {
    let (host, port) = if let Some(inner) = authority.strip_prefix('[') {
        let (host, after) = inner.split_once(']').ok_or(RequestError::MissingHost)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or(RequestError::InvalidPort)?)),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = match port {
        None | Some("") => None,
        Some(p) => Some(p.parse::<u16>().map_err(|_| RequestError::InvalidPort)?),
    };
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simple_request() {
        let req = GeminiRequest::parse("gemini://host/index.gmi").unwrap();
        assert_eq!(req.host, "host");
        assert_eq!(req.port, None);
        assert_eq!(req.path, "/index.gmi");
        assert_eq!(req.query, None);
    }

    #[test]
    fn test_empty_path_is_root() {
        assert_eq!(GeminiRequest::parse("gemini://host").unwrap().path, "/");
        assert_eq!(GeminiRequest::parse("gemini://host?q").unwrap().path, "/");
    }

    #[test]
    fn test_port_and_query() {
        let req = GeminiRequest::parse("GEMINI://host:1965/search?term%20x").unwrap();
        assert_eq!(req.port, Some(1965));
        assert_eq!(req.path, "/search");
        assert_eq!(req.query.as_deref(), Some("term%20x"));
    }

    #[test]
    fn test_ipv6_host() {
        let req = GeminiRequest::parse("gemini://[::1]:1965/").unwrap();
        assert_eq!(req.host, "::1");
        assert_eq!(req.port, Some(1965));
    }

    #[test]
    fn test_path_not_normalized() {
        let req = GeminiRequest::parse("gemini://host/../../etc").unwrap();
        assert_eq!(req.path, "/../../etc");
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            GeminiRequest::parse("/index.gmi"),
            Err(RequestError::NotAbsolute)
        );
        assert_eq!(
            GeminiRequest::parse("https://host/"),
            Err(RequestError::UnsupportedScheme("https".into()))
        );
        assert_eq!(
            GeminiRequest::parse("gemini://user@host/"),
            Err(RequestError::UserInfo)
        );
        assert_eq!(
            GeminiRequest::parse("gemini://host/#frag"),
            Err(RequestError::Fragment)
        );
        assert_eq!(GeminiRequest::parse("gemini:///x"), Err(RequestError::MissingHost));
        assert_eq!(
            GeminiRequest::parse("gemini://host:99999/"),
            Err(RequestError::InvalidPort)
        );
        assert_eq!(
            GeminiRequest::parse("gemini://host/a b"),
            Err(RequestError::InvalidCharacter)
        );
    }

    #[test]
    fn test_authority_check() {
        let req = GeminiRequest::parse("gemini://capsule.local:1966/").unwrap();
        let err = req
            .check_authority(|h| h == "capsule.local", 1965)
            .unwrap_err();
        assert_eq!(err, RequestError::PortMismatch(1966));
        assert_eq!(err.status(), Status::ProxyRequestRefused);

        let req = GeminiRequest::parse("gemini://elsewhere/").unwrap();
        assert_eq!(
            req.check_authority(|h| h == "capsule.local", 1965),
            Err(RequestError::HostMismatch("elsewhere".into()))
        );

        let req = GeminiRequest::parse("gemini://capsule.local/").unwrap();
        assert!(req.check_authority(|h| h == "capsule.local", 1965).is_ok());
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(RequestError::TooLong(1024).status(), Status::BadRequest);
        assert_eq!(RequestError::Fragment.status(), Status::BadRequest);
    }
}
