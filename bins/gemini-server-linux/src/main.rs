use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use gemini_core::{FsStore, ServerConfig};
use gemini_server::{Dispatcher, ServerContext, TlsSessionManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gemini_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Gemini server starting...");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gemini.json"));
    let config = load_config(&config_path)?;

    let store = FsStore::open(&config.root)
        .with_context(|| format!("cannot open content root {}", config.root.display()))?;
    let tls = TlsSessionManager::from_config(&config.tls).context("cannot load TLS material")?;
    tracing::info!("Serving {}", config.root.display());

    let ctx = Arc::new(ServerContext::new(config, Arc::new(store)));
    let (dispatcher, shutdown) = Dispatcher::bind(ctx, tls).await?;
    let mut server = tokio::spawn(dispatcher.run());

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, draining connections...");
            shutdown.shutdown();
            server.await??;
        }
        result = &mut server => {
            tracing::warn!("Dispatcher stopped");
            result??;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Load the configuration file, falling back to defaults when it is absent.
fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    if path.exists() {
        tracing::info!("Loading configuration from {}", path.display());
        return Ok(ServerConfig::load(path)?);
    }
    tracing::warn!("{} not found, using default configuration", path.display());
    let config = ServerConfig::default();
    config.validate()?;
    Ok(config)
}
