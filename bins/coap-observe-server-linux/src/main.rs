use std::path::PathBuf;

use clap::Parser;
use coap_observe_core::{ResourceMode, ServerSettings};
use coap_observe_server::{CoapServer, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CoAP server with an observable clock resource
#[derive(Parser, Debug)]
#[command(name = "coap-observe-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// UDP port of the server (default 5688)
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind to (default 0.0.0.0)
    #[arg(long)]
    bind: Option<String>,

    /// Report elapsed time instead of the tick count at startup
    #[arg(long)]
    time: bool,

    /// Milliseconds between notifications
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Upper bound on concurrent subscriptions
    #[arg(long)]
    max_subscriptions: Option<usize>,

    /// Path to a JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Settings from the file, overridden by flags given on the command line.
    fn settings(&self) -> anyhow::Result<ServerSettings> {
        let mut settings = match &self.config {
            Some(path) => ServerSettings::load(path)?,
            None => ServerSettings::default(),
        };

        if self.port.is_some() {
            settings.port = self.port;
        }
        if self.bind.is_some() {
            settings.bind = self.bind.clone();
        }
        if self.time {
            settings.mode = Some(ResourceMode::ElapsedTime);
        }
        if let Some(ms) = self.interval_ms {
            anyhow::ensure!(ms > 0, "--interval-ms must be at least 1");
            settings.notify_interval_ms = Some(ms);
        }
        if self.max_subscriptions.is_some() {
            settings.max_subscriptions = self.max_subscriptions;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,coap_observe_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = cli.settings()?;
    let config = ServerConfig::default().with_settings(&settings)?;

    tracing::info!("CoAP Observe server starting...");

    let server = CoapServer::bind(config).await?;
    let registry = server.registry();
    let addr = server.local_addr()?;

    let server_handle = tokio::spawn(server.run());

    tracing::info!("Try these commands:");
    tracing::info!("   coap-client -m get -s 10 coap://localhost:{}/some/path", addr.port());
    tracing::info!("   coap-client -m post coap://localhost:{}/time", addr.port());

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("CoAP server error: {}", e),
                _ => tracing::warn!("CoAP server stopped"),
            }
        }
    }

    let cancelled = registry.cancel_all();
    tracing::info!(cancelled, "Shutdown complete");
    Ok(())
}
