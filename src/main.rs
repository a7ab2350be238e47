use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod balancer;
mod config;
mod echo;
mod error;
mod observability;
mod proxy;
mod ratelimit;
mod watcher;

use app::App;
use config::Config;
use observability::{logging, MetricsCollector};
use watcher::{ConfigWatcher, DEFAULT_DEBOUNCE};

#[derive(Parser, Debug)]
#[command(name = "lb-proxy")]
#[command(about = "Reverse-proxy load balancer with per-client rate limiting and hot reload")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen port, overriding `server.port`
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    validate_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a test upstream that echoes requests back
    Echo {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        #[arg(short, long, default_value = "Hello from test server")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Echo { port, message }) = args.command {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
        return echo::run(port, message).await;
    }

    let config = Config::load(&args.config).await?;

    if args.validate_config {
        println!("Configuration is valid");
        return Ok(());
    }

    let log_handle = logging::init(&config)?;
    let span = logging::service_span(&config);
    info!(parent: &span, "Starting lb-proxy with config {}", args.config.display());

    let metrics_collector = MetricsCollector::new(&config.metrics)?;
    let metrics_task = if config.metrics.enabled {
        let metrics_collector = metrics_collector.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics_collector.start_server().await {
                error!("Metrics server error: {:#}", e);
            }
        }))
    } else {
        None
    };

    let (config_tx, config_rx) = watch::channel(Arc::new(config));
    let _watcher = match ConfigWatcher::start(&args.config, config_tx, DEFAULT_DEBOUNCE) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Hot reload disabled: {}", e);
            None
        }
    };

    let app = Arc::new(App::new(Some(log_handle)).with_port_override(args.port));
    let mut runner = {
        let app = app.clone();
        tokio::spawn(async move { app.run(config_rx).await }.instrument(span))
    };

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
        joined = &mut runner => match joined {
            Ok(Ok(())) => {
                warn!("Configuration updates stopped, serving the current configuration");
                shutdown_signal().await;
                info!("Received shutdown signal");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!("Reload loop panicked: {}", e)),
        },
    };

    runner.abort();
    app.shutdown().await;

    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    match &outcome {
        Ok(()) => info!("lb-proxy shutdown complete"),
        Err(e) => error!("lb-proxy stopped: {:#}", e),
    }
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
