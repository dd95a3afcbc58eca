//! Gemini status codes and response headers.
//!
//! A response starts with `<status><space><meta><CR><LF>`. For `2x` the meta
//! is a MIME type (or, on management connections, a short result) and a body
//! follows; for every other class the meta is a human readable message.

use std::fmt;

/// Longest meta string allowed by the protocol.
pub const MAX_META_LEN: usize = 1024;

/// Gemini status codes used by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    RedirectTemporary,
    RedirectPermanent,
    TemporaryFailure,
    ServerUnavailable,
    SlowDown,
    PermanentFailure,
    NotFound,
    Gone,
    ProxyRequestRefused,
    BadRequest,
    CertificateRequired,
    CertificateNotAuthorized,
    CertificateNotValid,
}

impl Status {
    /// Two-digit numeric code.
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 20,
            Status::RedirectTemporary => 30,
            Status::RedirectPermanent => 31,
            Status::TemporaryFailure => 40,
            Status::ServerUnavailable => 41,
            Status::SlowDown => 44,
            Status::PermanentFailure => 50,
            Status::NotFound => 51,
            Status::Gone => 52,
            Status::ProxyRequestRefused => 53,
            Status::BadRequest => 59,
            Status::CertificateRequired => 60,
            Status::CertificateNotAuthorized => 61,
            Status::CertificateNotValid => 62,
        }
    }

    /// Look a status up by its numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        let status = match code {
            20 => Status::Success,
            30 => Status::RedirectTemporary,
            31 => Status::RedirectPermanent,
            40 => Status::TemporaryFailure,
            41 => Status::ServerUnavailable,
            44 => Status::SlowDown,
            50 => Status::PermanentFailure,
            51 => Status::NotFound,
            52 => Status::Gone,
            53 => Status::ProxyRequestRefused,
            59 => Status::BadRequest,
            60 => Status::CertificateRequired,
            61 => Status::CertificateNotAuthorized,
            62 => Status::CertificateNotValid,
            _ => return None,
        };
        Some(status)
    }

    /// Default message for non-success responses.
    pub fn default_meta(self) -> &'static str {
        match self {
            Status::Success => "text/gemini; charset=utf-8",
            Status::RedirectTemporary | Status::RedirectPermanent => "/",
            Status::TemporaryFailure => "Temporary failure",
            Status::ServerUnavailable => "Server unavailable",
            Status::SlowDown => "Slow down",
            Status::PermanentFailure => "Permanent failure",
            Status::NotFound => "Not Found",
            Status::Gone => "Gone",
            Status::ProxyRequestRefused => "Proxy request refused",
            Status::BadRequest => "Bad Request",
            Status::CertificateRequired => "Client certificate required",
            Status::CertificateNotAuthorized => "Certificate not authorized",
            Status::CertificateNotValid => "Certificate not valid",
        }
    }

    pub fn is_success(self) -> bool {
        self.code() / 10 == 2
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The single header line of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: Status,
    pub meta: String,
}

impl ResponseHeader {
    /// Build a header; CR and LF in `meta` are replaced and the meta is
    /// truncated to the protocol limit.
    pub fn new(status: Status, meta: impl Into<String>) -> Self {
        let mut meta: String = meta
            .into()
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();
        if meta.len() > MAX_META_LEN {
            let mut end = MAX_META_LEN;
            while !meta.is_char_boundary(end) {
                end -= 1;
            }
            meta.truncate(end);
        }
        Self { status, meta }
    }

    /// `20 <mime>`.
    pub fn success(mime: &str) -> Self {
        Self::new(Status::Success, mime)
    }

    /// A header carrying the status's default message.
    pub fn from_status(status: Status) -> Self {
        Self::new(status, status.default_meta())
    }

    /// Parse a header line (without CRLF), as a client would.
    pub fn parse(line: &str) -> Option<Self> {
        let (code, meta) = line.split_once(' ').unwrap_or((line, ""));
        let status = Status::from_code(code.parse().ok()?)?;
        Some(Self::new(status, meta))
    }

    /// Wire form including the trailing CRLF.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for ResponseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}\r\n", self.status.code(), self.meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_success_header() {
        let header = ResponseHeader::success("text/gemini; charset=utf-8");
        assert_eq!(header.to_string(), "20 text/gemini; charset=utf-8\r\n");
    }

    #[test]
    fn test_meta_is_sanitized() {
        let header = ResponseHeader::new(Status::BadRequest, "bad\r\n20 text/gemini");
        assert_eq!(header.to_string(), "59 bad  20 text/gemini\r\n");

        let long = "é".repeat(MAX_META_LEN);
        let header = ResponseHeader::new(Status::NotFound, long);
        assert!(header.meta.len() <= MAX_META_LEN);
    }

    #[test]
    fn test_codes_round_trip_through_parse() {
        let header = ResponseHeader::parse("61 Certificate not authorized").unwrap();
        assert_eq!(header.status, Status::CertificateNotAuthorized);
        assert_eq!(header.meta, "Certificate not authorized");
        assert!(ResponseHeader::parse("99 nope").is_none());
        assert!(ResponseHeader::parse("abc").is_none());
    }

    #[test]
    fn test_status_classes() {
        assert!(Status::Success.is_success());
        assert!(!Status::NotFound.is_success());
        assert_eq!(Status::CertificateRequired.code() / 10, 6);
        assert_eq!(Status::ProxyRequestRefused.code() / 10, 5);
    }
}
