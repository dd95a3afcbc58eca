//! Bounded line and byte I/O over a connection stream.
//!
//! The read buffer has a fixed capacity chosen from the configured limits.
//! Every read and write is bounded by the idle timeout and by the
//! connection's total deadline, whichever comes first.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use gemini_core::Limits;

use crate::error::{ServerError, TimeoutKind};

pub(crate) struct Wire<S> {
    stream: S,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    idle: Duration,
    deadline: Instant,
    write_chunk: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    pub(crate) fn new(stream: S, limits: &Limits, deadline: Instant) -> Self {
        let capacity = (limits.max_request_line + 2)
            .max(limits.max_chunk_size)
            .max(limits.read_slice_size);
        Self {
            stream,
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
            idle: limits.idle_timeout(),
            deadline,
            write_chunk: limits.write_chunk_size.max(1),
        }
    }

    fn io_deadline(&self) -> (Instant, TimeoutKind) {
        let idle = Instant::now() + self.idle;
        if idle < self.deadline {
            (idle, TimeoutKind::Idle)
        } else {
            (self.deadline, TimeoutKind::Total)
        }
    }

    /// Read more bytes into the buffer. Returns 0 at end of stream.
    async fn fill(&mut self) -> Result<usize, ServerError> {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.end == self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            return Err(ServerError::ProtocolSyntax("read buffer exhausted".into()));
        }

        let (deadline, kind) = self.io_deadline();
        let read = self.stream.read(&mut self.buf[self.end..]);
        let n = timeout_at(deadline, read)
            .await
            .map_err(|_| ServerError::Timeout(kind))??;
        self.end += n;
        Ok(n)
    }

    /// Read one LF-terminated line of at most `max` bytes, not counting the
    /// terminator. An optional CR before the LF is stripped.
    ///
    /// Returns `None` when the peer closes cleanly between lines.
    pub(crate) async fn read_line(&mut self, max: usize) -> Result<Option<String>, ServerError> {
        loop {
            let pending = &self.buf[self.start..self.end];
            if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let mut line = &pending[..pos];
                if let Some(stripped) = line.strip_suffix(b"\r") {
                    line = stripped;
                }
                if line.len() > max {
                    return Err(line_too_long(max));
                }
                let line = std::str::from_utf8(line)
                    .map_err(|_| ServerError::ProtocolSyntax("line is not valid UTF-8".into()))?
                    .to_string();
                self.start += pos + 1;
                return Ok(Some(line));
            }
            // A CR may still precede the LF
            if pending.len() > max + 1 {
                return Err(line_too_long(max));
            }

            if self.fill().await? == 0 {
                return if self.start == self.end {
                    Ok(None)
                } else {
                    Err(ServerError::ClientAbort)
                };
            }
        }
    }

    /// Up to `max` bytes, from the buffer or the stream. Empty at end of stream.
    pub(crate) async fn read_some(&mut self, max: usize) -> Result<&[u8], ServerError> {
        if self.start == self.end && self.fill().await? == 0 {
            return Ok(&[]);
        }
        let n = max.min(self.end - self.start);
        let from = self.start;
        self.start += n;
        Ok(&self.buf[from..from + n])
    }

    /// Write `bytes` in pieces of the configured write size.
    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        for piece in bytes.chunks(self.write_chunk) {
            let (deadline, kind) = self.io_deadline();
            timeout_at(deadline, self.stream.write_all(piece))
                .await
                .map_err(|_| ServerError::Timeout(kind))??;
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), ServerError> {
        let (deadline, kind) = self.io_deadline();
        timeout_at(deadline, self.stream.flush())
            .await
            .map_err(|_| ServerError::Timeout(kind))??;
        Ok(())
    }

    /// Flush and close the write side. Errors are ignored; the peer may
    /// already be gone.
    pub(crate) async fn shutdown(&mut self) {
        let (deadline, _) = self.io_deadline();
        let _ = timeout_at(deadline, self.stream.shutdown()).await;
    }
}

fn line_too_long(max: usize) -> ServerError {
    ServerError::ProtocolSyntax(format!("line exceeds {} bytes", max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn limits() -> Limits {
        Limits {
            max_request_line: 16,
            max_chunk_size: 8,
            read_slice_size: 8,
            write_chunk_size: 4,
            ..Limits::default()
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_lines_and_leftover_bytes() {
        let (mut client, server) = duplex(64);
        let mut wire = Wire::new(server, &limits(), far_deadline());

        client.write_all(b"LIST /\r\nUPLOAD a 3\nxyz").await.unwrap();
        drop(client);

        assert_eq!(wire.read_line(16).await.unwrap().as_deref(), Some("LIST /"));
        assert_eq!(wire.read_line(16).await.unwrap().as_deref(), Some("UPLOAD a 3"));
        assert_eq!(wire.read_some(2).await.unwrap(), b"xy");
        assert_eq!(wire.read_some(8).await.unwrap(), b"z");
        assert_eq!(wire.read_some(8).await.unwrap(), b"");
        assert_eq!(wire.read_line(16).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_long_line_rejected() {
        let (mut client, server) = duplex(64);
        let mut wire = Wire::new(server, &limits(), far_deadline());
        client.write_all(&[b'a'; 40]).await.unwrap();

        let err = wire.read_line(16).await.unwrap_err();
        assert!(matches!(err, ServerError::ProtocolSyntax(_)));
    }

    #[tokio::test]
    async fn test_line_at_exact_limit() {
        let (mut client, server) = duplex(64);
        let mut wire = Wire::new(server, &limits(), far_deadline());
        client.write_all(b"0123456789abcdef\r\n").await.unwrap();
        assert_eq!(
            wire.read_line(16).await.unwrap().as_deref(),
            Some("0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_truncated_line_is_abort() {
        let (mut client, server) = duplex(64);
        let mut wire = Wire::new(server, &limits(), far_deadline());
        client.write_all(b"gemini://x").await.unwrap();
        drop(client);
        assert!(matches!(
            wire.read_line(16).await,
            Err(ServerError::ClientAbort)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_client, server) = duplex(64);
        let mut limits = limits();
        limits.idle_timeout_secs = 1;
        let mut wire = Wire::new(server, &limits, far_deadline());
        assert!(matches!(
            wire.read_line(16).await,
            Err(ServerError::Timeout(TimeoutKind::Idle))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_deadline_wins() {
        let (_client, server) = duplex(64);
        let deadline = Instant::now() + Duration::from_millis(100);
        let mut wire = Wire::new(server, &limits(), deadline);
        assert!(matches!(
            wire.read_line(16).await,
            Err(ServerError::Timeout(TimeoutKind::Total))
        ));
    }

    #[tokio::test]
    async fn test_chunked_writes() {
        let (mut client, server) = duplex(64);
        let mut wire = Wire::new(server, &limits(), far_deadline());
        wire.write_all(b"20 text/gemini\r\nbody").await.unwrap();
        wire.shutdown().await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"20 text/gemini\r\nbody");
    }
}
