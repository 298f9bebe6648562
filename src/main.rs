//! Tesseract transaction pipeline service
//!
//! Connects to the configured ledger nodes and serves fee estimation, transaction
//! building, broadcast and status tracking over HTTP.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tesseract_tx_pipeline::{api, metrics, metrics::MetricsServer, Settings, TransactionPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!(
        "Starting Tesseract transaction pipeline v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} ledgers",
        settings.enabled_ledgers().len()
    );

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Connect ledger nodes and wire the pipeline
    let pipeline = Arc::new(TransactionPipeline::from_settings(&settings)?);
    info!("Ledger adapters initialized: {:?}", pipeline.ledgers());

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let pipeline = pipeline.clone();
        async move {
            if let Err(e) = api::run_server(api_config, pipeline).await {
                error!("API server error: {:#}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {:#}", e);
            }
        })
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let pipeline = pipeline.clone();
        let interval = settings.pipeline.health_check_interval();
        async move {
            loop {
                tokio::time::sleep(interval).await;

                for (ledger, healthy) in pipeline.health_check().await {
                    if !healthy {
                        warn!("Ledger {} health check failed", ledger);
                    }
                }

                metrics::set_monitored_transactions(pipeline.monitoring_tasks().len());
            }
        }
    });

    info!("Tesseract transaction pipeline is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    for task in pipeline.monitoring_tasks() {
        pipeline.stop_monitoring(&task.hash);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Tesseract transaction pipeline stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tesseract_tx_pipeline=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
