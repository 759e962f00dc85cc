use colored::*;
use lib_telemetry::{Pipeline, PipelineStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};

/// Prints a statistics report every `stats_interval_secs` and logs health
/// warnings until shutdown.
pub async fn run(pipeline: Arc<Pipeline>, mut shutdown: broadcast::Receiver<()>) {
    let secs = pipeline.config().monitoring.stats_interval_secs.max(1);
    let mut report_interval = interval(Duration::from_secs(secs));
    report_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    report_interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = report_interval.tick() => {
                print_report(&pipeline.stats());
                for warning in pipeline.health_warnings() {
                    log::warn!("Health: {}", warning);
                }
            }
        }
    }
}

/// Writes a report to stdout.
pub fn print_report(stats: &PipelineStats) {
    let ts = chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]");
    println!("{} {}", ts, "Pipeline statistics".bold());
    for line in render_report(stats) {
        println!("  {}", line);
    }
}

/// Report lines, one per stage. Counters that signal trouble are coloured
/// once they leave zero.
pub fn render_report(stats: &PipelineStats) -> Vec<String> {
    let b = &stats.buffer;
    let pr = &stats.processing;
    let d = &stats.dispatch;
    let dom = &stats.domain;
    let p = &stats.persistence;

    vec![
        format!("{} {}", "uptime:".cyan(), format_uptime(stats.uptime_secs)),
        format!(
            "{} received={} size={}/{} overflows={}",
            "buffer:".cyan(),
            b.messages_received,
            b.current_size,
            b.capacity,
            flag(b.overflow_count),
        ),
        format!(
            "{} processed={} queued={}/{} dropped={} running={}",
            "intake:".cyan(),
            pr.messages_processed,
            pr.queue_size,
            pr.intake_capacity,
            flag(pr.intake_dropped),
            pr.is_running,
        ),
        format!(
            "{} dispatched={} malformed={} raw={} handler_failures={}",
            "dispatch:".cyan(),
            d.dispatched,
            d.malformed_topics,
            d.raw_only,
            flag(d.handler_failures),
        ),
        format!(
            "{} sensors={} status={} alerts={} emergencies={}",
            "domain:".cyan(),
            dom.sensor_events,
            dom.status_events,
            dom.alerts_raised,
            flag(dom.emergencies_raised),
        ),
        format!(
            "{} queued={} completed={} batches={} queue={}/{} overflows={} errors={}",
            "database:".cyan(),
            p.operations_queued,
            p.operations_completed,
            p.batch_inserts,
            p.queue_size,
            p.queue_capacity,
            flag(p.queue_overflows),
            flag(p.errors),
        ),
    ]
}

fn flag(count: u64) -> ColoredString {
    if count == 0 {
        count.to_string().normal()
    } else {
        count.to_string().red().bold()
    }
}

fn format_uptime(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
