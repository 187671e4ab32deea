use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (DOCHUB_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("DOCHUB_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("dochub=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = dochub::config::ServerConfig::parse();
    tracing::info!("Starting collaboration server on {}", config.listen_addr);
    tracing::info!("Internal broadcast API on {}", config.internal_listen_addr);
    if config.internal_secret.is_none() {
        tracing::warn!("No internal shared secret configured; broadcast API will refuse requests");
    }

    let server = dochub::server::Server::new(config);
    server.run().await
}
