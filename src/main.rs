use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use smarthome_gateway::config::Config;
use smarthome_gateway::observability::{self, AccessLog, MetricsCollector, Observability};
use smarthome_gateway::proxy::Gateway;

#[derive(Parser, Debug)]
#[command(name = "smarthome-gateway")]
#[command(about = "Smart Home API gateway (Backend for Frontend)")]
struct Args {
    /// Optional YAML config file; environment variables override it.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<String>,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).await?;

    observability::init_tracing(&config.logging);

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("API Gateway starting...");

    let metrics = Arc::new(MetricsCollector::new(&config.metrics)?);
    let (access_log, access_log_writer) = AccessLog::start(&config.logging.access_log).await?;
    let gateway = Arc::new(Gateway::new(config, Observability::new(metrics, access_log))?);

    if let Err(e) = gateway.start(shutdown_signal()).await {
        error!("Gateway error: {:#}", e);
        access_log_writer.finish().await;
        return Err(e);
    }

    // Every gateway handle, and with it the outbound connection pool and the
    // access log senders, is gone once `start` returns.
    access_log_writer.finish().await;
    info!("API Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
