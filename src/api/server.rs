//! Server assembly: wire every long-lived dependency at startup, spawn the
//! background tasks, serve HTTP, and shut down gracefully.

use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::http::{AppState, router};
use super::ws::Broadcaster;
use crate::blob::FsBlobStore;
use crate::config::Config;
use crate::ingest::EventProcessor;
use crate::pipeline::{RecoverySweeper, TranscriptPipeline};
use crate::store::SqliteStore;
use crate::stream::{Consumer, SqliteStream};
use crate::summary::{AnthropicSummarizer, Summarizer};

/// Run the server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the database cannot be opened, the listener cannot
/// be bound, or serving fails.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    anyhow::ensure!(
        !config.api_key.is_empty(),
        "an API key is required (TRACELINE_API_KEY or --api-key)"
    );

    tracing::debug!("Initializing database store...");
    let store = Arc::new(
        SqliteStore::new(&config.database_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to initialize database at {}",
                    config.database_path.display()
                )
            })?,
    );
    tracing::debug!("Database store initialized");

    let transport = Arc::new(SqliteStream::new(store.pool()));
    let blobs = Arc::new(FsBlobStore::new(config.blob_root.clone()));
    let broadcaster = Arc::new(Broadcaster::new(config.ws));

    let summarizer: Option<Arc<dyn Summarizer>> = match &config.anthropic_api_key {
        Some(key) => {
            tracing::info!("Summary provider configured");
            Some(Arc::new(AnthropicSummarizer::new(key.clone())?))
        }
        None => {
            tracing::info!("No summary provider; sessions will stop at parsed");
            None
        }
    };

    let pipeline = Arc::new(TranscriptPipeline::new(
        Arc::clone(&store),
        blobs.clone() as Arc<dyn crate::blob::BlobStore>,
        summarizer,
        Arc::clone(&broadcaster),
    ));

    let processor = Arc::new(EventProcessor::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        Arc::clone(&broadcaster),
        config.correlation_lookback(),
    ));

    let sweeper = Arc::new(RecoverySweeper::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        config.recovery,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = Consumer::new(
        transport.clone() as Arc<dyn crate::stream::StreamTransport>,
        processor,
        config.consumer,
    );
    let consumer_task = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };

    let sweeper_task = {
        let sweeper = Arc::clone(&sweeper);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { sweeper.run_ticker(shutdown_rx).await })
    };

    let config = Arc::new(config);
    let state = AppState {
        store,
        transport: transport as Arc<dyn crate::stream::StreamTransport>,
        broadcaster: Arc::clone(&broadcaster),
        blobs: blobs as Arc<dyn crate::blob::BlobStore>,
        pipeline,
        sweeper,
        config: Arc::clone(&config),
        started_at: Instant::now(),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("HTTP server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Accepting has stopped; drain background work, then close connections.
    tracing::info!("Shutting down: draining background tasks");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = consumer_task.await;
        let _ = sweeper_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("Background tasks did not drain within 10s");
    }

    broadcaster.shutdown();
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
