//! Line-oriented message feed.
//!
//! Each line carries one wire message as `<topic> <payload>`: the topic runs
//! up to the first whitespace and the rest of the line is the payload, kept
//! verbatim. Blank lines and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use lib_telemetry::Pipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Counters for one feed run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedSummary {
    pub lines_read: u64,
    pub submitted: u64,
    pub buffered_only: u64,
    pub skipped: u64,
}

/// Splits a feed line into topic and payload.
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    match trimmed.split_once(char::is_whitespace) {
        Some((topic, payload)) => Some((topic, payload.trim_start())),
        None => Some((trimmed, "")),
    }
}

/// Reads the configured input (stdin when `None`) until EOF or shutdown.
pub async fn run(
    input: Option<PathBuf>,
    pipeline: Arc<Pipeline>,
    shutdown: broadcast::Receiver<()>,
) -> Result<FeedSummary> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open feed input {}", path.display()))?;
            log::info!("Reading telemetry from {}", path.display());
            pump(BufReader::new(file), &pipeline, shutdown).await
        }
        None => {
            log::info!("Reading telemetry from stdin");
            pump(BufReader::new(tokio::io::stdin()), &pipeline, shutdown).await
        }
    }
}

async fn pump<R>(
    reader: R,
    pipeline: &Pipeline,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<FeedSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = FeedSummary::default();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Feed received shutdown signal");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read feed input")? else {
                    log::info!("Feed input reached end of stream");
                    break;
                };
                summary.lines_read += 1;
                match parse_line(&line) {
                    Some((topic, payload)) => {
                        if pipeline.on_message(topic, payload.as_bytes()) {
                            summary.submitted += 1;
                        } else {
                            summary.buffered_only += 1;
                        }
                    }
                    None => summary.skipped += 1,
                }
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_telemetry::SqliteStore;
    use std::time::Duration;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("devices/h1/sensors/gas {\"value\": 1, \"unit\": \"ppm\"}"),
            Some(("devices/h1/sensors/gas", "{\"value\": 1, \"unit\": \"ppm\"}"))
        );
        assert_eq!(parse_line("  devices/h1/status/ping\r\n"), Some(("devices/h1/status/ping", "")));
        assert_eq!(parse_line("devices/h1/sensors/temp \t36.5C"), Some(("devices/h1/sensors/temp", "36.5C")));
        assert_eq!(parse_line("# replay of shift 3"), None);
        assert_eq!(parse_line("   "), None);
    }

    #[tokio::test]
    async fn test_pump_feeds_every_message_line() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = Pipeline::new(lib_telemetry::PipelineConfig::default(), store);
        pipeline.start();

        let input: &[u8] = b"# header\n\
            devices/h1/sensors/temperature {\"value\": 36.6}\n\
            \n\
            devices/h1/status/heartbeat {\"status\": \"active\"}\n";
        let (_tx, rx) = broadcast::channel(1);
        let summary = pump(BufReader::new(input), &pipeline, rx).await.unwrap();

        assert_eq!(summary.lines_read, 4);
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(pipeline.stats().buffer.messages_received, 2);

        assert!(pipeline.wait_for_queue_empty(Duration::from_secs(5)).await);
        pipeline.stop().await;
    }
}
