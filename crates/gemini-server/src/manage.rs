//! File management over mutually authenticated connections.
//!
//! A session carries any number of `LIST`, `DELETE` and `UPLOAD` commands
//! until `QUIT` or end of stream. Uploads are staged and only published by
//! an atomic commit; an [`UploadSession`] dropped before commit (client
//! abort, timeout, protocol error) discards its staged bytes.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use gemini_core::{
    ContentStore, EntryKind, PathKind, Removal, ResolveError, StagedWrite, StoreError, VirtualPath,
};
use gemini_protocol::{
    parse_chunk_header, render_list_body, Command, ResponseHeader, Status, UploadLength,
};

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::wire::Wire;

/// Longest chunk header line accepted in a chunked upload.
const CHUNK_HEADER_MAX: usize = 32;

// ============================================================================
// Upload session
// ============================================================================

/// Progress of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Receiving,
    Committing,
    Committed,
    Aborted,
}

/// A staged write that is discarded unless committed.
pub struct UploadSession {
    store: Arc<dyn ContentStore>,
    staged: Option<StagedWrite>,
    target: VirtualPath,
    declared: UploadLength,
    received: u64,
    max_size: u64,
    state: UploadState,
}

impl UploadSession {
    /// Open a staged write for `target`.
    pub fn begin(
        store: Arc<dyn ContentStore>,
        target: VirtualPath,
        declared: UploadLength,
        max_size: u64,
    ) -> Result<Self, ServerError> {
        if let UploadLength::Exact(len) = declared {
            if len > max_size {
                return Err(too_large(max_size));
            }
        }
        let staged = store.write_staged(&target)?;
        debug!("Upload {} started for {} ({:?})", staged.id(), target, declared);
        Ok(Self {
            store,
            staged: Some(staged),
            target,
            declared,
            received: 0,
            max_size,
            state: UploadState::Receiving,
        })
    }

    pub fn target(&self) -> &VirtualPath {
        &self.target
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Append received bytes to the staged write.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        let staged = self
            .staged
            .as_mut()
            .ok_or_else(|| ServerError::ProtocolSyntax("upload is not receiving".into()))?;
        let received = self.received + bytes.len() as u64;
        let limit = match self.declared {
            UploadLength::Exact(len) => len,
            UploadLength::Chunked => self.max_size,
        };
        if received > limit {
            return Err(too_large(limit));
        }
        self.store.append(staged, bytes)?;
        self.received = received;
        Ok(())
    }

    /// Publish the staged bytes. Returns the published size.
    pub fn commit(mut self) -> Result<u64, ServerError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| ServerError::ProtocolSyntax("upload is not receiving".into()))?;
        if let UploadLength::Exact(len) = self.declared {
            if self.received != len {
                self.staged = Some(staged);
                return Err(ServerError::ProtocolSyntax(format!(
                    "received {} of {} declared bytes",
                    self.received, len
                )));
            }
        }
        self.state = UploadState::Committing;
        match self.store.commit(staged) {
            Ok(size) => {
                self.state = UploadState::Committed;
                Ok(size)
            }
            Err(e) => {
                // A failed commit removes its own staging data
                self.state = UploadState::Aborted;
                Err(e.into())
            }
        }
    }

    /// Throw the staged bytes away.
    pub fn abort(self) {
        drop(self);
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        let Some(staged) = self.staged.take() else {
            return;
        };
        self.state = UploadState::Aborted;
        let id = staged.id();
        match self.store.discard(staged) {
            Ok(()) => debug!("Upload {} for {} discarded", id, self.target),
            Err(e) => warn!("Failed to discard upload {}: {}", id, e),
        }
    }
}

fn too_large(limit: u64) -> ServerError {
    ServerError::ProtocolSyntax(format!("upload exceeds {} bytes", limit))
}

// ============================================================================
// Management session
// ============================================================================

/// Per-connection management state. At most one upload is open at a time.
#[derive(Default)]
pub struct ManagementSession {
    upload: Option<UploadSession>,
    commands: u64,
}

impl ManagementSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands executed so far.
    pub fn commands(&self) -> u64 {
        self.commands
    }

    pub fn has_upload(&self) -> bool {
        self.upload.is_some()
    }

    /// Open the session's upload; a second upload while one is open is
    /// rejected.
    pub fn begin_upload(
        &mut self,
        store: Arc<dyn ContentStore>,
        target: VirtualPath,
        declared: UploadLength,
        max_size: u64,
    ) -> Result<&mut UploadSession, ServerError> {
        if self.upload.is_some() {
            return Err(ServerError::ProtocolSyntax(
                "an upload is already in progress".into(),
            ));
        }
        let upload = UploadSession::begin(store, target, declared, max_size)?;
        Ok(self.upload.insert(upload))
    }

    pub fn upload_mut(&mut self) -> Option<&mut UploadSession> {
        self.upload.as_mut()
    }

    /// Commit the open upload.
    pub fn finish_upload(&mut self) -> Result<u64, ServerError> {
        let upload = self
            .upload
            .take()
            .ok_or_else(|| ServerError::ProtocolSyntax("no upload in progress".into()))?;
        upload.commit()
    }

    /// Discard the open upload, if any.
    pub fn abort_upload(&mut self) {
        if let Some(upload) = self.upload.take() {
            upload.abort();
        }
    }
}

// ============================================================================
// Command execution
// ============================================================================

/// What the connection does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// Execute one command and write its response.
///
/// Errors that leave the stream in sync (storage failures, rejected paths
/// outside of an upload) are answered here and the session continues. Any
/// other error is returned and ends the connection.
pub(crate) async fn execute<S>(
    ctx: &ServerContext,
    session: &mut ManagementSession,
    wire: &mut Wire<S>,
    command: Command,
) -> Result<Flow, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.commands += 1;
    let is_upload = matches!(command, Command::Upload { .. });

    let outcome = match command {
        Command::Quit => return Ok(Flow::Close),
        Command::List { path } => list(ctx, &path),
        Command::Delete { path } => delete(ctx, &path).map(|h| h.to_string()),
        Command::Upload { path, length } => upload(ctx, session, wire, &path, length)
            .await
            .map(|h| h.to_string()),
    };

    match outcome {
        Ok(response) => {
            wire.write_all(response.as_bytes()).await?;
            wire.flush().await?;
            Ok(Flow::Continue)
        }
        Err(e) if e.is_recoverable() && !is_upload => {
            debug!("Command failed: {}", e);
            let status = e.status().unwrap_or(Status::TemporaryFailure);
            let header = ResponseHeader::new(status, e.meta());
            wire.write_all(&header.to_bytes()).await?;
            wire.flush().await?;
            Ok(Flow::Continue)
        }
        Err(e) => Err(e),
    }
}

fn resolve_failed(e: ResolveError) -> ServerError {
    match e {
        ResolveError::Rejected(rejection) => {
            warn!("Rejected management path: {}", rejection);
            ServerError::rejected(rejection)
        }
        ResolveError::Storage(e) => e.into(),
    }
}

fn parse_target(raw: &str) -> Result<VirtualPath, ServerError> {
    VirtualPath::parse(raw).map_err(|rejection| resolve_failed(ResolveError::Rejected(rejection)))
}

fn list(ctx: &ServerContext, raw: &str) -> Result<String, ServerError> {
    let resolved = ctx.resolver.resolve(raw).map_err(resolve_failed)?;
    match resolved.kind {
        PathKind::Directory => {
            let entries = ctx.store.list(&resolved.path)?;
            Ok(render_list_body(&entries))
        }
        PathKind::File => Err(StoreError::NotADirectory(resolved.path).into()),
        PathKind::NotFound => Err(StoreError::NotFound(resolved.path).into()),
    }
}

fn delete(ctx: &ServerContext, raw: &str) -> Result<ResponseHeader, ServerError> {
    let path = parse_target(raw)?;
    if path.is_root() {
        return Err(StoreError::RootImmutable.into());
    }

    let removal = ctx.store.delete(&path);
    {
        let mut cache = ctx.cache();
        match removal {
            // Entries below a removed directory are not tracked individually
            Ok(Removal::Directory) => cache.invalidate_all(),
            _ => {
                cache.invalidate(&path);
            }
        }
    }

    let meta = match removal? {
        Removal::File | Removal::Directory => {
            info!("Deleted {}", path);
            "deleted"
        }
        Removal::AlreadyAbsent => "already absent",
    };
    Ok(ResponseHeader::new(Status::Success, meta))
}

async fn upload<S>(
    ctx: &ServerContext,
    session: &mut ManagementSession,
    wire: &mut Wire<S>,
    raw: &str,
    length: UploadLength,
) -> Result<ResponseHeader, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = parse_target(raw)?;
    if target.is_root() {
        return Err(StoreError::RootImmutable.into());
    }
    if matches!(ctx.store.stat(&target)?, Some(stat) if stat.kind == EntryKind::Directory) {
        return Err(StoreError::IsADirectory(target).into());
    }

    let limits = &ctx.config.limits;
    session.begin_upload(ctx.store.clone(), target.clone(), length, limits.max_upload_size)?;

    let received = match session.upload_mut() {
        Some(upload) => {
            receive(wire, upload, length, limits.max_chunk_size, limits.read_slice_size).await
        }
        None => Err(ServerError::ProtocolSyntax("no upload in progress".into())),
    };
    if let Err(e) = received {
        session.abort_upload();
        return Err(e);
    }

    let committed = session.finish_upload();
    // Invalidate whether or not the commit landed
    ctx.cache().invalidate(&target);
    let size = committed?;
    info!("Stored {} ({} bytes)", target, size);
    Ok(ResponseHeader::new(Status::Success, format!("stored {}", size)))
}

async fn receive<S>(
    wire: &mut Wire<S>,
    upload: &mut UploadSession,
    length: UploadLength,
    max_chunk: usize,
    slice: usize,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match length {
        UploadLength::Exact(len) => copy_exact(wire, upload, len, slice).await,
        UploadLength::Chunked => loop {
            let line = wire
                .read_line(CHUNK_HEADER_MAX)
                .await?
                .ok_or(ServerError::ClientAbort)?;
            let size = parse_chunk_header(&line, max_chunk)?;
            if size == 0 {
                return Ok(());
            }
            copy_exact(wire, upload, size as u64, slice).await?;
        },
    }
}

async fn copy_exact<S>(
    wire: &mut Wire<S>,
    upload: &mut UploadSession,
    mut remaining: u64,
    slice: usize,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while remaining > 0 {
        let want = remaining.min(slice as u64) as usize;
        let bytes = wire.read_some(want).await?;
        if bytes.is_empty() {
            return Err(ServerError::ClientAbort);
        }
        upload.append(bytes)?;
        remaining -= bytes.len() as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini_core::MemoryStore;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[test]
    fn test_upload_commit() {
        let store = Arc::new(MemoryStore::new());
        let mut upload =
            UploadSession::begin(store.clone(), vp("a.gmi"), UploadLength::Exact(5), 1024).unwrap();
        upload.append(b"hel").unwrap();
        upload.append(b"lo").unwrap();
        assert_eq!(upload.state(), UploadState::Receiving);
        assert_eq!(upload.commit().unwrap(), 5);
        assert_eq!(store.read(&vp("a.gmi")).unwrap(), b"hello");
        assert_eq!(store.staged_count(), 0);
    }

    #[test]
    fn test_drop_discards_staging() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a.gmi", b"original");
        {
            let mut upload =
                UploadSession::begin(store.clone(), vp("a.gmi"), UploadLength::Chunked, 1024)
                    .unwrap();
            upload.append(b"partial").unwrap();
            assert_eq!(store.staged_count(), 1);
        }
        assert_eq!(store.staged_count(), 0);
        assert_eq!(store.read(&vp("a.gmi")).unwrap(), b"original");
    }

    #[test]
    fn test_size_limits() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            UploadSession::begin(store.clone(), vp("a"), UploadLength::Exact(11), 10),
            Err(ServerError::ProtocolSyntax(_))
        ));

        let mut upload =
            UploadSession::begin(store.clone(), vp("a"), UploadLength::Chunked, 10).unwrap();
        upload.append(b"0123456789").unwrap();
        assert!(upload.append(b"x").is_err());

        let mut short =
            UploadSession::begin(store.clone(), vp("b"), UploadLength::Exact(4), 10).unwrap();
        short.append(b"ab").unwrap();
        assert!(short.commit().is_err());
        assert_eq!(store.staged_count(), 1);
        drop(upload);
        assert_eq!(store.staged_count(), 0);
        assert!(store.stat(&vp("b")).unwrap().is_none());
    }

    #[test]
    fn test_one_upload_per_session() {
        let store = Arc::new(MemoryStore::new());
        let mut session = ManagementSession::new();
        session
            .begin_upload(store.clone(), vp("a"), UploadLength::Chunked, 10)
            .unwrap();
        assert!(matches!(
            session.begin_upload(store.clone(), vp("b"), UploadLength::Chunked, 10),
            Err(ServerError::ProtocolSyntax(_))
        ));
        assert_eq!(store.staged_count(), 1);

        session.abort_upload();
        assert!(!session.has_upload());
        assert_eq!(store.staged_count(), 0);
    }
}
