use anyhow::{Context, Result};
use dataset_service::api::{start_api_server, AppState};
use dataset_service::{
    CaptioningClient, Config, DatasetService, PgMetadataStore, S3BlobStore, TaggingPipeline,
    TaggingScheduler,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting dataset service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Stores first; the scheduler and the API only receive ready handles
    let metadata_store = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 blob store")?,
    );

    let captioner = Arc::new(
        CaptioningClient::new(&config.captioning.endpoint, config.captioning_timeout())
            .context("Failed to initialize captioning client")?,
    );

    let shutdown = CancellationToken::new();

    let scheduler_handle = if config.scheduler.enabled {
        let pipeline = TaggingPipeline::new(
            blob_store.clone(),
            metadata_store.clone(),
            captioner,
        )
        .with_work_dir(config.scheduler.work_dir.clone());

        let scheduler = TaggingScheduler::new(
            metadata_store.clone(),
            Arc::new(pipeline),
            config.poll_interval(),
        );
        Some(scheduler.spawn(shutdown.clone()))
    } else {
        warn!("Tagging scheduler disabled");
        None
    };

    let api_state = AppState {
        datasets: DatasetService::new(
            metadata_store.clone(),
            blob_store.clone(),
            config.s3.key_prefix.clone(),
        ),
    };

    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Dataset service started successfully");

    shutdown_signal().await;

    info!("Shutting down dataset service");
    shutdown.cancel();

    // A job in flight runs to its terminal status before the scheduler exits
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task panicked");
        }
    }
    if let Err(e) = api_handle.await {
        error!(error = %e, "API task panicked");
    }

    info!("Dataset service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
