//! Slipstream server binary entry point.
//!
//! Parses configuration, initializes logging and the TLS crypto provider, then
//! runs the server until ctrl-c.

use anyhow::Result;
use slipstream_server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // reqwest is built without a default provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = ServerConfig::from_args();

    tracing::info!(
        "Configuration loaded: bind={}, upstream={:?}, cache_dir={:?}",
        config.bind,
        config.upstream.as_ref().map(url::Url::as_str),
        config.cache_dir
    );

    config.validate()?;

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
