//! Logging for the ingest server.
//!
//! Every line is tagged with the pipeline component that produced it
//! (`buffer`, `dispatch`, `persistence`, `feed`, ...). Two files are written
//! per run: the full log and an errors-only log that keeps emergency banners
//! and failed batches out of the noise. Older runs are pruned at startup.

use anyhow::Result;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

const LOG_PREFIX: &str = "server_ingest_";
const ERROR_LOG_PREFIX: &str = "server_ingest_errors_";

pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep only the most recent previous run of each log kind
    cleanup_old_logs(log_dir)?;

    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_path = log_dir.join(format!("{}{}.log", LOG_PREFIX, stamp));
    let error_log_path = log_dir.join(format!("{}{}.log", ERROR_LOG_PREFIX, stamp));

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                component(record.target()),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Error)
                .chain(fern::log_file(error_log_path)?),
        )
        .apply()?;

    Ok(())
}

fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Short component name for a log target.
fn component(target: &str) -> &str {
    let mut segments = target.split("::");
    match segments.next() {
        Some("lib_telemetry") => match segments.next() {
            Some("core") => match segments.next() {
                Some("ingest_buffer") => "buffer",
                Some("dispatcher" | "registry") => "dispatch",
                Some("processor") => "processor",
                _ => "pipeline",
            },
            Some("persistence" | "connections") => "persistence",
            Some("domain") => "domain",
            Some("configs") => "config",
            _ => "telemetry",
        },
        Some("server_ingest") => match segments.last() {
            Some("ingest_logic") | None => "server",
            Some(module) => module,
        },
        _ => target,
    }
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .collect();

    let (mut errors, mut runs): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|e| e.file_name().to_string_lossy().starts_with(ERROR_LOG_PREFIX));

    for family in [&mut runs, &mut errors] {
        // Newest first; unreadable timestamps sort last
        family.sort_by_key(|e| {
            std::cmp::Reverse(
                e.metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH),
            )
        });
        for entry in family.iter().skip(1) {
            if let Err(e) = fs::remove_file(entry.path()) {
                eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e);
            }
        }
    }

    Ok(())
}
