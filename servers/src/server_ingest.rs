use anyhow::{Context, Result};
use lib_telemetry::{Pipeline, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

mod ingest_logic;
use ingest_logic::{activity, config, feed, logger, monitor};

/// Starts every stage, failing when any of them was already running.
fn start_pipeline(pipeline: &Pipeline) -> Result<()> {
    if !pipeline.start() {
        anyhow::bail!("Telemetry pipeline did not start cleanly; a stage was already running");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logger::setup_logging(&log_dir, &log_level)?;

    let pipeline_config = config.pipeline()?;
    let db = &pipeline_config.database;
    let store = SqliteStore::open(&db.db_path, db.wal_mode).with_context(|| {
        format!("Failed to initialize database at {}", db.db_path.display())
    })?;
    log::info!("Database ready at {}", db.db_path.display());

    let pipeline = Arc::new(Pipeline::new(pipeline_config, Arc::new(store)));
    activity::register(&pipeline);
    start_pipeline(&pipeline)?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let mut feed_handle = tokio::spawn(feed::run(
        config.input.clone(),
        Arc::clone(&pipeline),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        Arc::clone(&pipeline),
        shutdown_tx.subscribe(),
    ));

    // Wait for a shutdown signal or the end of the input
    let mut feed_result = None;
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Could not install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
        joined = &mut feed_handle => {
            log::info!("Input finished, initiating shutdown.");
            feed_result = Some(joined);
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let feed_result = match feed_result {
        Some(joined) => joined,
        None => feed_handle.await,
    };
    match feed_result {
        Ok(Ok(summary)) => log::info!(
            "Feed read {} lines: {} submitted, {} buffered only, {} skipped",
            summary.lines_read,
            summary.submitted,
            summary.buffered_only,
            summary.skipped
        ),
        Ok(Err(e)) => log::error!("Feed failed: {:#}", e),
        Err(e) => log::error!("Feed task failed: {}", e),
    }
    if let Err(e) = monitor_handle.await {
        log::error!("Monitor task failed: {}", e);
    }

    pipeline.stop().await;
    monitor::print_report(&pipeline.stats());

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_telemetry::PipelineConfig;

    #[tokio::test]
    async fn test_start_pipeline_rejects_a_running_pipeline() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = Pipeline::new(PipelineConfig::default(), store);

        assert!(start_pipeline(&pipeline).is_ok());
        let err = start_pipeline(&pipeline).unwrap_err();
        assert!(err.to_string().contains("did not start"));
        pipeline.stop().await;
    }
}
