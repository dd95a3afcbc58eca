//! Per-connection state machine.
//!
//! A connection reads one line and routes it by grammar. A Gemini request
//! is answered and the connection closes. A management command on an
//! authorized connection starts a session that lasts until `QUIT`, end of
//! stream or the first error that desynchronizes the stream.

use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use gemini_core::{StoreError, VirtualPath};
use gemini_protocol::{Command, ResponseHeader, Status};

use crate::context::ServerContext;
use crate::error::{ServerError, TimeoutKind};
use crate::gemini::{self, Body, Response};
use crate::manage::{self, Flow, ManagementSession};
use crate::tls::{ClientIdentity, TlsSessionManager, TlsState};
use crate::wire::Wire;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepted,
    Handshaking,
    Reading,
    Processing,
    Writing,
    Closed,
}

/// Request grammar offered on a connection, decided once after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    GeminiOnly,
    GeminiAndManagement,
}

impl Grammar {
    pub fn for_connection(management_listener: bool, identity: &ClientIdentity) -> Self {
        if management_listener && identity.is_authorized() {
            Grammar::GeminiAndManagement
        } else {
            Grammar::GeminiOnly
        }
    }
}

/// Facts about the socket and the listener it arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    /// Port the listener is bound to, checked against request URIs.
    pub port: u16,
    /// The listener offers management commands.
    pub management: bool,
}

/// One client connection after the TLS handshake.
pub struct Connection<S> {
    ctx: Arc<ServerContext>,
    wire: Wire<S>,
    info: ConnectionInfo,
    identity: ClientIdentity,
    grammar: Grammar,
    phase: Phase,
    tls_state: TlsState,
    session: ManagementSession,
    header_sent: bool,
}

/// Run the TLS handshake on an accepted socket.
///
/// `accepted` is when the socket was accepted; the total deadline counts
/// from there and the handshake must finish within its own, shorter limit.
pub async fn establish<IO>(
    io: IO,
    ctx: Arc<ServerContext>,
    tls: &TlsSessionManager,
    acceptor: &TlsAcceptor,
    info: ConnectionInfo,
    accepted: Instant,
) -> Result<Connection<TlsStream<IO>>, ServerError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let limits = &ctx.config.limits;
    let deadline = accepted + limits.total_timeout();
    let handshake_deadline = (accepted + limits.handshake_timeout()).min(deadline);

    let mut tls_state = TlsState::Idle;
    trace!("{}: {:?} -> {:?}", info.peer, Phase::Accepted, Phase::Handshaking);
    trace!("{}: TLS {:?} -> {:?}", info.peer, tls_state, TlsState::Handshaking);
    tls_state = TlsState::Handshaking;

    let (stream, identity) = match tls.handshake(acceptor, io, handshake_deadline).await {
        Ok(session) => session,
        Err(e) => {
            match &e {
                ServerError::Timeout(TimeoutKind::Handshake) => warn!(
                    "{}: handshake timeout in phase {:?}",
                    info.peer,
                    Phase::Handshaking
                ),
                other => warn!("TLS handshake with {} failed: {}", info.peer, other),
            }
            trace!("{}: TLS {:?} -> {:?}", info.peer, tls_state, TlsState::Closed);
            return Err(e);
        }
    };

    let mut connection = Connection::with_deadline(stream, ctx, info, identity, deadline);
    connection.phase = Phase::Handshaking;
    debug!(
        "Handshake with {} complete ({:?} -> {:?})",
        connection.info.peer, tls_state, connection.tls_state
    );
    Ok(connection)
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap a stream. The total deadline starts now.
    pub fn new(
        stream: S,
        ctx: Arc<ServerContext>,
        info: ConnectionInfo,
        identity: ClientIdentity,
    ) -> Self {
        let deadline = Instant::now() + ctx.config.limits.total_timeout();
        Self::with_deadline(stream, ctx, info, identity, deadline)
    }

    /// Wrap a stream whose total deadline was fixed at accept time.
    pub fn with_deadline(
        stream: S,
        ctx: Arc<ServerContext>,
        info: ConnectionInfo,
        identity: ClientIdentity,
        deadline: Instant,
    ) -> Self {
        let grammar = Grammar::for_connection(info.management, &identity);
        let tls_state = TlsState::after_handshake(&identity);
        Self {
            wire: Wire::new(stream, &ctx.config.limits, deadline),
            ctx,
            info,
            identity,
            grammar,
            phase: Phase::Accepted,
            tls_state,
            session: ManagementSession::new(),
            header_sent: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn grammar(&self) -> Grammar {
        self.grammar
    }

    pub fn tls_state(&self) -> TlsState {
        self.tls_state
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    fn set_phase(&mut self, phase: Phase) {
        trace!("{}: {:?} -> {:?}", self.info.peer, self.phase, phase);
        self.phase = phase;
    }

    /// Serve the connection to completion.
    ///
    /// Any open upload is discarded and the stream is closed before this
    /// returns, whatever the outcome.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let result = self.serve().await;
        if let Err(e) = &result {
            self.respond_to_error(e).await;
        }

        self.session.abort_upload();
        self.wire.shutdown().await;
        self.tls_state = TlsState::Closed;
        self.set_phase(Phase::Closed);
        result
    }

    async fn serve(&mut self) -> Result<(), ServerError> {
        let max_line = self.ctx.config.limits.max_request_line;
        loop {
            self.set_phase(Phase::Reading);
            self.header_sent = false;
            let Some(line) = self.wire.read_line(max_line).await? else {
                debug!("{} closed the connection", self.info.peer);
                return Ok(());
            };

            self.set_phase(Phase::Processing);
            if self.info.management && Command::is_command(&line) {
                if self.run_command(&line).await? == Flow::Close {
                    return Ok(());
                }
                continue;
            }

            let response = gemini::handle_request(&self.ctx, &line, self.info.port);
            info!(
                "{} \"{}\" {}",
                self.info.peer,
                line,
                response.header.status.code()
            );
            return self.send(response).await;
        }
    }

    async fn run_command(&mut self, line: &str) -> Result<Flow, ServerError> {
        if self.grammar == Grammar::GeminiOnly {
            let status = if self.identity.has_certificate() {
                Status::CertificateNotAuthorized
            } else {
                Status::CertificateRequired
            };
            warn!(
                "{} sent a management command with {}",
                self.info.peer,
                self.identity
                    .fingerprint()
                    .map(|f| format!("unauthorized certificate {}", f))
                    .unwrap_or_else(|| "no certificate".to_string())
            );
            return Err(ServerError::Security {
                status,
                reason: status.default_meta().to_string(),
            });
        }

        let command = Command::parse(line)?;
        info!("{} {}", self.info.peer, line);
        if command.is_mutation() {
            debug!(
                "Mutation by {}",
                self.identity.fingerprint().unwrap_or_default()
            );
        }
        manage::execute(&self.ctx, &mut self.session, &mut self.wire, command).await
    }

    async fn send(&mut self, response: Response) -> Result<(), ServerError> {
        let Response { mut header, body } = response;

        // Open streamed files before committing to a success header
        let mut reader = None;
        if let Body::Stream { path, .. } = &body {
            match self.ctx.store.reader(path) {
                Ok(opened) => reader = Some(opened),
                Err(e) => {
                    let e = ServerError::from(e);
                    warn!("Cannot stream {}: {}", path, e);
                    let status = e.status().unwrap_or(Status::TemporaryFailure);
                    header = ResponseHeader::from_status(status);
                }
            }
        }

        self.set_phase(Phase::Writing);
        self.tls_state = TlsState::Streaming;
        self.header_sent = true;
        self.wire.write_all(&header.to_bytes()).await?;

        match body {
            Body::Empty => {}
            Body::Bytes(bytes) => self.wire.write_all(&bytes).await?,
            Body::Text(text) => self.wire.write_all(text.as_bytes()).await?,
            Body::Stream { path, size } => {
                if let Some(reader) = reader {
                    self.stream_file(reader, &path, size).await?;
                }
            }
        }
        self.wire.flush().await
    }

    async fn stream_file(
        &mut self,
        mut reader: Box<dyn Read + Send>,
        path: &VirtualPath,
        size: u64,
    ) -> Result<(), ServerError> {
        let mut slice = vec![0u8; self.ctx.config.limits.read_slice_size];
        let mut sent = 0u64;
        loop {
            let n = match reader.read(&mut slice) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(StoreError::Io {
                        path: path.to_string(),
                        source: e,
                    }
                    .into())
                }
            };
            self.wire.write_all(&slice[..n]).await?;
            sent += n as u64;
        }
        if sent != size {
            debug!("{} changed size while streaming ({} of {} bytes)", path, sent, size);
        }
        Ok(())
    }

    /// Best effort error response. Nothing is sent once a header went out.
    async fn respond_to_error(&mut self, e: &ServerError) {
        match e {
            ServerError::Timeout(kind) => {
                warn!("{}: {:?} timeout in phase {:?}", self.info.peer, kind, self.phase);
                return;
            }
            ServerError::ClientAbort => {
                debug!("{} aborted in phase {:?}", self.info.peer, self.phase);
                return;
            }
            _ => {}
        }
        if self.header_sent {
            return;
        }
        let Some(status) = e.status() else {
            return;
        };
        let header = ResponseHeader::new(status, e.meta());
        self.header_sent = true;
        if self.wire.write_all(&header.to_bytes()).await.is_ok() {
            let _ = self.wire.flush().await;
        }
    }
}
