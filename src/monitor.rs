use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Duration;

use time::OffsetDateTime;
use time::macros::format_description;

use crate::AppResult;
use crate::store::{MonitorStats, Store};

const BAR_LENGTH: usize = 40;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub once: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            once: false,
        }
    }
}

/// Estimate time remaining by extrapolating the observed rate.
fn format_remaining(
    processed: i64,
    total: i64,
    start_time: OffsetDateTime,
    now: OffsetDateTime,
) -> String {
    if processed <= 0 {
        return "Unknown".to_string();
    }
    let elapsed = (now - start_time).as_seconds_f64();
    if elapsed <= 0.0 {
        return "Unknown".to_string();
    }
    let rate = processed as f64 / elapsed;
    let remaining = ((total - processed).max(0) as f64 / rate).round() as i64;

    if remaining < 60 {
        format!("{remaining}s")
    } else if remaining < 3600 {
        format!("{}m", remaining / 60)
    } else {
        format!("{}h {}m", remaining / 3600, (remaining % 3600) / 60)
    }
}

fn progress_bar(processed: i64, total: i64) -> String {
    let filled = if total > 0 {
        (BAR_LENGTH as i64 * processed.clamp(0, total) / total) as usize
    } else {
        0
    };
    format!(
        "[{}{}]",
        "\u{2588}".repeat(filled),
        "\u{2591}".repeat(BAR_LENGTH - filled)
    )
}

/// Render one snapshot as the text dashboard. Pure so it can be tested
/// without a terminal or a ticking clock.
pub fn render_stats(stats: &MonitorStats, now: OffsetDateTime) -> AppResult<String> {
    let mut out = String::new();
    let date_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

    writeln!(out, "{}", "=".repeat(60))?;
    writeln!(out, "FEEDBACK ANALYSIS MONITOR")?;
    writeln!(out, "{}", "=".repeat(60))?;
    writeln!(out, "Time: {}", now.format(&date_format)?)?;
    writeln!(out)?;

    if stats.total > 0 {
        let percent = stats.processed as f64 / stats.total as f64 * 100.0;
        writeln!(
            out,
            "Overall Progress: {} {percent:.1}%",
            progress_bar(stats.processed, stats.total)
        )?;
        writeln!(out, "Processed: {} / {}", stats.processed, stats.total)?;
        writeln!(out, "Failed: {}", stats.failed)?;
        writeln!(out)?;
    }

    match &stats.phase {
        Some(phase) => {
            writeln!(out, "Current Phase: {}", phase.phase)?;
            if phase.total > 0 {
                let percent = phase.processed as f64 / phase.total as f64 * 100.0;
                writeln!(
                    out,
                    "Phase Progress: {} / {} ({percent:.1}%)",
                    phase.processed, phase.total
                )?;
                writeln!(
                    out,
                    "Est. Time Remaining: {}",
                    format_remaining(phase.processed, phase.total, phase.start_time, now)
                )?;
            }
        }
        None => {
            writeln!(out, "Current Phase: Not started")?;
        }
    }
    writeln!(out)?;

    if stats.clustered > 0 {
        writeln!(out, "Clustering Results:")?;
        writeln!(out, "  Clusters Found: {}", stats.num_clusters)?;
        writeln!(out, "  Clustered: {}", stats.clustered)?;
        writeln!(out, "  Unassigned: {}", stats.noise)?;
        writeln!(out)?;
    }

    if stats.completed_batches > 0 {
        writeln!(out, "Batch Performance:")?;
        writeln!(out, "  Completed: {}", stats.completed_batches)?;
        writeln!(out, "  Failed: {}", stats.failed_batches)?;
        writeln!(out, "  Avg Time: {:.2}s", stats.avg_batch_secs)?;
    }

    if stats.recent_errors > 0 {
        writeln!(out, "\nRecent errors: {} (last 5 min)", stats.recent_errors)?;
    }

    Ok(out)
}

/// Poll the store and redraw the dashboard until interrupted. Strictly
/// read-only; intended to run in a separate process from the pipeline.
#[tracing::instrument(name = "Monitoring analysis", level = "info", skip(store))]
pub async fn run_monitor(store: &Store, config: &MonitorConfig) -> AppResult<()> {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        ticker.tick().await;
        let stats = store.monitor_stats().await?;
        let rendered = render_stats(&stats, OffsetDateTime::now_utc())?;

        let mut stdout = std::io::stdout();
        // Clear screen and home the cursor between redraws.
        write!(stdout, "\x1b[2J\x1b[H{rendered}")?;
        if !config.once {
            writeln!(stdout, "\nPress Ctrl+C to exit")?;
        }
        stdout.flush()?;

        if config.once {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::store::PhaseStats;

    fn sample_stats() -> MonitorStats {
        MonitorStats {
            total: 200,
            processed: 100,
            failed: 10,
            clustered: 80,
            noise: 10,
            num_clusters: 4,
            phase: Some(PhaseStats {
                phase: "embedding_generation".to_string(),
                total: 100,
                processed: 50,
                start_time: datetime!(2025-05-01 12:00 UTC),
            }),
            completed_batches: 5,
            failed_batches: 1,
            avg_batch_secs: 2.5,
            recent_errors: 3,
        }
    }

    #[test]
    fn renders_every_section() {
        let rendered = render_stats(&sample_stats(), datetime!(2025-05-01 12:01 UTC)).unwrap();
        assert!(rendered.contains("Overall Progress:"));
        assert!(rendered.contains("50.0%"));
        assert!(rendered.contains("Current Phase: embedding_generation"));
        assert!(rendered.contains("Clusters Found: 4"));
        assert!(rendered.contains("Avg Time: 2.50s"));
        assert!(rendered.contains("Recent errors: 3"));
    }

    #[test]
    fn eta_extrapolates_from_the_observed_rate() {
        // 50 of 100 processed in one minute: one more minute to go.
        let eta = format_remaining(
            50,
            100,
            datetime!(2025-05-01 12:00 UTC),
            datetime!(2025-05-01 12:01 UTC),
        );
        assert_eq!(eta, "1m");
    }

    #[test]
    fn eta_is_unknown_before_any_progress() {
        let eta = format_remaining(
            0,
            100,
            datetime!(2025-05-01 12:00 UTC),
            datetime!(2025-05-01 12:01 UTC),
        );
        assert_eq!(eta, "Unknown");
    }

    #[test]
    fn empty_store_renders_not_started() {
        let rendered = render_stats(&MonitorStats::default(), datetime!(2025-05-01 12:00 UTC)).unwrap();
        assert!(rendered.contains("Current Phase: Not started"));
        assert!(!rendered.contains("Clustering Results"));
    }
}
