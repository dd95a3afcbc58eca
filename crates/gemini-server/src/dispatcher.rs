//! Accept loop, connection limit and graceful shutdown.
//!
//! One task serves each accepted connection. On shutdown the dispatcher
//! stops accepting, waits for in-flight connections to finish (each is
//! still bounded by its own deadlines) and only then closes the listening
//! sockets.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use gemini_core::ListenerConfig;

use crate::connection::{establish, ConnectionInfo};
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::tls::TlsSessionManager;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Triggers a graceful shutdown of a running [`Dispatcher`].
///
/// Dropping every handle also shuts the dispatcher down.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

struct BoundListener {
    socket: TcpListener,
    config: ListenerConfig,
    acceptor: TlsAcceptor,
    port: u16,
}

/// Owns the listening sockets and the connection tasks.
pub struct Dispatcher {
    ctx: Arc<ServerContext>,
    tls: Arc<TlsSessionManager>,
    listeners: Vec<BoundListener>,
    slots: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Bind every configured listener.
    pub async fn bind(
        ctx: Arc<ServerContext>,
        tls: TlsSessionManager,
    ) -> Result<(Self, ShutdownHandle), ServerError> {
        let mut listeners = Vec::with_capacity(ctx.config.listeners.len());
        for config in &ctx.config.listeners {
            let socket = TcpListener::bind(config.bind).await?;
            let local = socket.local_addr()?;
            info!(
                "Gemini server listening on {} (client certificates: {:?}, management: {})",
                local, config.client_auth, config.management
            );
            listeners.push(BoundListener {
                acceptor: tls.acceptor(config.client_auth)?,
                socket,
                config: config.clone(),
                port: local.port(),
            });
        }

        let (tx, rx) = watch::channel(false);
        let dispatcher = Self {
            slots: Arc::new(Semaphore::new(ctx.config.limits.max_connections)),
            ctx,
            tls: Arc::new(tls),
            listeners,
            shutdown: rx,
        };
        Ok((dispatcher, ShutdownHandle { tx: Arc::new(tx) }))
    }

    /// Addresses actually bound (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.socket.local_addr().ok())
            .collect()
    }

    /// Accept and serve connections until shutdown, then drain.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut tasks = JoinSet::new();
        let mut first = 0;

        while !*self.shutdown.borrow() {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                (index, accepted) = accept_any(&self.listeners, first) => match accepted {
                    Ok((tcp, peer)) => {
                        first = index + 1;
                        self.spawn_connection(&mut tasks, index, tcp, peer);
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down, draining {} connection(s)", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }
        drop(self.listeners);
        info!("Listeners closed");
        Ok(())
    }

    fn spawn_connection(
        &self,
        tasks: &mut JoinSet<()>,
        index: usize,
        tcp: TcpStream,
        peer: SocketAddr,
    ) {
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            warn!("Connection limit reached, dropping {}", peer);
            return;
        };
        let listener = &self.listeners[index];
        let info = ConnectionInfo {
            peer,
            port: listener.port,
            management: listener.config.management,
        };
        let ctx = self.ctx.clone();
        let tls = self.tls.clone();
        let acceptor = listener.acceptor.clone();

        tasks.spawn(async move {
            let _permit = permit;
            serve_connection(ctx, tls, acceptor, tcp, info).await;
        });
    }
}

/// Listener indices in polling order, starting at `first` and wrapping.
fn poll_order(first: usize, len: usize) -> impl Iterator<Item = usize> {
    (0..len).map(move |offset| (first + offset) % len)
}

/// Accept from whichever listener is ready. Polling starts at `first` so a
/// busy listener cannot starve the ones after it.
async fn accept_any(
    listeners: &[BoundListener],
    first: usize,
) -> (usize, io::Result<(TcpStream, SocketAddr)>) {
    poll_fn(|cx| {
        for index in poll_order(first, listeners.len()) {
            if let Poll::Ready(accepted) = listeners[index].socket.poll_accept(cx) {
                return Poll::Ready((index, accepted));
            }
        }
        Poll::Pending
    })
    .await
}

async fn serve_connection(
    ctx: Arc<ServerContext>,
    tls: Arc<TlsSessionManager>,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    info: ConnectionInfo,
) {
    let peer = info.peer;
    debug!("New connection from {}", peer);

    let Ok(connection) = establish(tcp, ctx, &tls, &acceptor, info, Instant::now()).await else {
        return;
    };
    match connection.run().await {
        Ok(()) => debug!("Connection from {} closed", peer),
        Err(ServerError::Timeout(_)) | Err(ServerError::ClientAbort) => {}
        Err(e) => warn!("Connection error from {}: {}", peer, e),
    }
}
