use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use chat_gateway::config::{FileConfig, GatewayConfig, load_config};
use chat_gateway::{AppState, GatewayInstance, broker, create_router};

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Horizontally scalable chat gateway")]
struct Cli {
    /// Port for the web server (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides server.host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Broker URL, e.g. redis://127.0.0.1:6379 or memory:// (overrides broker.url)
    #[arg(long)]
    broker_url: Option<String>,

    /// Config file (defaults to ./gateway.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// Flags sit on top of defaults, gateway.toml and GATEWAY_* env vars.
    fn apply(&self, fc: &mut FileConfig) {
        if let Some(port) = self.port {
            fc.server.port = port;
        }
        if let Some(host) = &self.host {
            fc.server.host = host.clone();
        }
        if let Some(url) = &self.broker_url {
            fc.broker.url = Some(url.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "chat_gateway=debug,gateway=debug,tower_http=debug,info"
    } else {
        "chat_gateway=info,gateway=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    cli.apply(&mut file_config);
    let config = GatewayConfig::from_file(&file_config).context("Invalid configuration")?;

    // Everything that can fail on the broker happens before we bind.
    let broker = broker::connect(&config.broker_url)
        .await
        .context("Failed to connect to broker")?;
    info!(backend = broker.backend_name(), "Connected to broker");

    let instance = Arc::new(
        GatewayInstance::start(broker, config.instance.clone())
            .await
            .context("Failed to initialize connection count")?,
    );

    let state = AppState {
        instance: instance.clone(),
        port: config.listen_addr.port(),
    };
    let app = create_router(state, config.cors_origin.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Chat gateway listening on http://{}", actual_addr);
    info!("  GET /healthcheck - Instance health");
    info!("  GET /metrics     - Instance metrics");
    info!("  GET /ws          - Chat WebSocket");

    let closing = instance.closing_token();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(closing.cancelled_owned())
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, cleaning up...");
        }
        result = &mut server => {
            // The listener stopped without a signal; still reconcile before exiting.
            instance.shutdown(config.shutdown_grace).await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("Server error"),
                Err(e) => Err(e).context("Server task failed"),
            };
        }
    }

    instance.shutdown(config.shutdown_grace).await;

    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => error!("Server task failed during shutdown: {}", e),
        Err(_) => warn!("Grace period elapsed, forcing remaining connections closed"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
