use anyhow::Result;
use clap::Parser;
use lib_telemetry::{Pipeline, PipelineConfig, SqliteStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Drives synthetic helmet telemetry through the full pipeline", long_about = None)]
struct Args {
    /// Number of simulated helmets
    #[clap(short, long, default_value_t = 10)]
    devices: usize,

    /// Messages sent by each helmet
    #[clap(short, long, default_value_t = 500)]
    messages: usize,

    /// Per-helmet send rate in messages per second (0 sends as fast as possible)
    #[clap(short, long, default_value_t = 0)]
    rate: u64,

    /// SQLite file to write to. A temporary database is used when unset
    #[clap(long)]
    db_path: Option<PathBuf>,

    /// Operations per database batch
    #[clap(long, default_value_t = 15)]
    batch_size: usize,

    /// Persistence queue capacity
    #[clap(long, default_value_t = 200)]
    max_queue_size: usize,
}

/// One synthetic message per step, cycling through every sensor and the
/// heartbeat status. Some readings cross alert thresholds.
fn synthetic_message(device: &str, step: usize) -> (String, String) {
    let gas_status = if step % 50 == 0 { "ALARM" } else { "NORMAL" };
    let (subtopic, payload) = match step % 5 {
        0 => (
            "sensors/gas",
            json!({"sensor": "gas", "value": 300 + (step % 1600), "status": gas_status, "unit": "ppm"}),
        ),
        1 => (
            "sensors/temperature",
            json!({"sensor": "temperature", "value": 36.0 + (step % 60) as f64 / 10.0, "unit": "celsius"}),
        ),
        2 => (
            "sensors/pulse",
            json!({"sensor": "pulse_oximeter", "heart_rate": 60 + (step % 100), "spo2": 88 + (step % 12)}),
        ),
        3 => (
            "sensors/gps",
            json!({"sensor": "gps", "latitude": 41.0 + step as f64 * 1e-5, "longitude": 29.0, "altitude": 40}),
        ),
        _ => (
            "status/heartbeat",
            json!({"type": "status", "status": "active", "battery_level": 100 - (step % 100)}),
        ),
    };
    (format!("devices/{}/{}", device, subtopic), payload.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let temp_dir = tempfile::tempdir()?;
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.path().join("throughput.db"));

    let mut config = PipelineConfig::default();
    config.database.db_path = db_path.clone();
    config.database.batch_size = args.batch_size;
    config.database.max_queue_size = args.max_queue_size;
    config.validate()?;

    let store = Arc::new(SqliteStore::open(&db_path, config.database.wal_mode)?);
    let pipeline = Arc::new(Pipeline::new(config, store));
    if !pipeline.start() {
        anyhow::bail!("Pipeline did not start");
    }

    println!(
        "Sending {} messages from {} helmets into {}",
        args.devices * args.messages,
        args.devices,
        db_path.display()
    );

    let started = Instant::now();
    let mut producers = Vec::with_capacity(args.devices);
    for d in 0..args.devices {
        let pipeline = Arc::clone(&pipeline);
        let messages = args.messages;
        let pause = (args.rate > 0).then(|| Duration::from_secs_f64(1.0 / args.rate as f64));
        producers.push(tokio::spawn(async move {
            let device = format!("helmet_{:03}", d);
            let mut accepted = 0usize;
            for step in 0..messages {
                let (topic, payload) = synthetic_message(&device, step);
                if pipeline.on_message(&topic, payload.as_bytes()) {
                    accepted += 1;
                }
                match pause {
                    Some(pause) => sleep(pause).await,
                    None => tokio::task::yield_now().await,
                }
            }
            accepted
        }));
    }

    let mut accepted = 0usize;
    for producer in producers {
        accepted += producer.await?;
    }
    let send_elapsed = started.elapsed();

    // Let the processor drain the intake before stopping it
    while pipeline.stats().processing.queue_size > 0 {
        sleep(Duration::from_millis(20)).await;
    }
    pipeline.stop().await;
    let total_elapsed = started.elapsed();

    let stats = pipeline.stats();
    let sent = args.devices * args.messages;
    println!("--- Throughput ---");
    println!(
        "sent:       {} in {:.2}s ({:.0} msg/s)",
        sent,
        send_elapsed.as_secs_f64(),
        sent as f64 / send_elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "processed:  {} ({} accepted, {} dropped at intake)",
        stats.processing.messages_processed, accepted, stats.processing.intake_dropped
    );
    println!(
        "database:   {} operations in {} batches, {} overflows, {} failed batches",
        stats.persistence.operations_completed,
        stats.persistence.batch_inserts,
        stats.persistence.queue_overflows,
        stats.persistence.errors
    );
    println!(
        "domain:     {} alerts, {} emergencies",
        stats.domain.alerts_raised, stats.domain.emergencies_raised
    );
    println!(
        "end-to-end: {:.2}s ({:.0} ops/s persisted)",
        total_elapsed.as_secs_f64(),
        stats.persistence.operations_completed as f64 / total_elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
