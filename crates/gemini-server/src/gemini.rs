//! Gemini request handling.
//!
//! Turns one request line into a [`Response`]. Everything here is
//! synchronous; the connection writes the response afterwards.

use std::sync::Arc;

use tracing::{debug, warn};

use gemini_core::mime::TEXT_GEMINI;
use gemini_core::{PathKind, ResolveError, ResolvedPath, StoreError, VirtualPath};
use gemini_protocol::{render_directory_document, GeminiRequest, ResponseHeader, Status};

use crate::context::ServerContext;

/// Response body.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    /// Whole file content, from the cache or a fresh read.
    Bytes(Arc<[u8]>),
    /// Generated document.
    Text(String),
    /// File too large to cache, read from storage slice by slice.
    Stream { path: VirtualPath, size: u64 },
}

/// Header plus body for a single request.
#[derive(Debug, Clone)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: Body,
}

impl Response {
    /// A header-only response.
    pub fn status(status: Status, meta: impl Into<String>) -> Self {
        Self {
            header: ResponseHeader::new(status, meta),
            body: Body::Empty,
        }
    }

    fn default_for(status: Status) -> Self {
        Self {
            header: ResponseHeader::from_status(status),
            body: Body::Empty,
        }
    }

    fn storage_failure(e: &StoreError) -> Self {
        warn!("Storage failure: {}", e);
        Self::default_for(Status::TemporaryFailure)
    }
}

/// Handle one Gemini request line (CRLF removed).
pub fn handle_request(ctx: &ServerContext, line: &str, listener_port: u16) -> Response {
    let request = match GeminiRequest::parse(line) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected request line: {}", e);
            return Response::status(e.status(), e.to_string());
        }
    };
    if let Err(e) = request.check_authority(|host| ctx.config.accepts_host(host), listener_port) {
        debug!("Refused request for {}: {}", request.host, e);
        return Response::status(e.status(), e.to_string());
    }

    let resolved = match ctx.resolver.resolve(&request.path) {
        Ok(resolved) => resolved,
        Err(ResolveError::Rejected(rejection)) => {
            warn!("Rejected path {:?}: {}", request.path, rejection);
            return Response::default_for(Status::BadRequest);
        }
        Err(ResolveError::Storage(e)) => return Response::storage_failure(&e),
    };

    match resolved.kind {
        PathKind::File => serve_file(ctx, &resolved),
        PathKind::Directory => serve_directory(ctx, &resolved),
        PathKind::NotFound => Response::default_for(Status::NotFound),
    }
}

fn serve_file(ctx: &ServerContext, resolved: &ResolvedPath) -> Response {
    let admitted = ctx.cache().admits(resolved.size);
    if !admitted {
        let mime = ctx.mimes.resolve(resolved.path.as_str());
        return Response {
            header: ResponseHeader::success(mime),
            body: Body::Stream {
                path: resolved.path.clone(),
                size: resolved.size,
            },
        };
    }

    let content = ctx.cache().get(ctx.store.as_ref(), resolved, &ctx.mimes);
    match content {
        Ok(content) => Response {
            header: ResponseHeader::success(&content.mime),
            body: Body::Bytes(content.body),
        },
        // Deleted between stat and read
        Err(StoreError::NotFound(_)) => Response::default_for(Status::NotFound),
        Err(e) => Response::storage_failure(&e),
    }
}

fn serve_directory(ctx: &ServerContext, resolved: &ResolvedPath) -> Response {
    if let Some(index) = ctx.config.index_file.as_deref() {
        if let Ok(index_path) = resolved.path.join(index) {
            match ctx.resolver.classify(index_path) {
                Ok(index) if index.is_file() => return serve_file(ctx, &index),
                Ok(_) => {}
                Err(e) => return Response::storage_failure(&e),
            }
        }
    }

    if !ctx.config.directory_listing {
        return Response::default_for(Status::NotFound);
    }
    match ctx.store.list(&resolved.path) {
        Ok(entries) => Response {
            header: ResponseHeader::success(TEXT_GEMINI),
            body: Body::Text(render_directory_document(&resolved.path, &entries)),
        },
        Err(StoreError::NotFound(_)) => Response::default_for(Status::NotFound),
        Err(e) => Response::storage_failure(&e),
    }
}
