use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use http_logger::{Config, LogFormat, LoggingTracer, ProxyContext, ProxyServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it picks the log format
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!(
        version = http_logger::VERSION,
        "Starting {}",
        http_logger::NAME
    );

    let context = ProxyContext::from_config(&config, Arc::new(LoggingTracer)).await?;
    if context.interceptor.is_enabled() {
        info!("HTTPS interception enabled");
    } else {
        info!("Running in plaintext-only mode");
    }

    let server = ProxyServer::bind(config.listen_addr()?, Arc::new(context)).await?;
    let handle = server.start()?;

    shutdown_signal().await;
    handle.stop().await;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
