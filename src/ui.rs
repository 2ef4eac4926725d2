//! Operator-facing output on stderr: startup stage spinners and the end-of-run summary.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::aggregate::CrowdSnapshot;
use crate::pipeline::RunReport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    /// Unknown values fall back to `Auto`.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `disable_pretty` turns `Auto` into plain output, e.g. when stdout is piped.
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        let pretty = is_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => !disable_pretty,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if !self.pretty {
            eprintln!("==> {}", name);
            return StageGuard::new(name.to_string(), None);
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_draw_target(ProgressDrawTarget::stderr());
        spinner.enable_steady_tick(Duration::from_millis(120));
        let style = ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(format!("{name}…"));
        StageGuard::new(name.to_string(), Some(spinner))
    }

    pub fn report(&self, report: &RunReport) {
        for line in report_lines(report) {
            eprintln!("{line}");
        }
    }
}

/// Prints a completion line when dropped.
pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failed: false,
        }
    }

    /// Mark the stage as failed so the completion line says so.
    pub fn fail(mut self) {
        self.failed = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.failed { "✘" } else { "✔" };
        let message = format!(
            "{} {} ({})",
            mark,
            self.name,
            format_duration(self.start.elapsed())
        );
        match &self.spinner {
            Some(spinner) if self.failed => spinner.abandon_with_message(message),
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub fn snapshot_line(snapshot: &CrowdSnapshot) -> String {
    format!(
        "seq={} count={} density={} trend={} anomaly={} processing={}ms",
        snapshot.seq,
        snapshot.count,
        snapshot.density.as_str(),
        snapshot.trend.map(|t| t.as_str()).unwrap_or("-"),
        snapshot.anomaly,
        snapshot.processing_ms
    )
}

fn report_lines(report: &RunReport) -> Vec<String> {
    let mean_people = if report.snapshots == 0 {
        0.0
    } else {
        report.total_people as f64 / report.snapshots as f64
    };
    vec![
        format!("run stopped: {:?}", report.stop_reason),
        format!(
            "  frames    read={} processed={} skipped={}",
            report.frames_read, report.frames_processed, report.frames_skipped
        ),
        format!(
            "  people    snapshots={} mean={:.1} peak={}",
            report.snapshots, mean_people, report.peak_count
        ),
        format!(
            "  inference mean={:.1}ms worst={} over_budget={}",
            report.mean_inference_ms,
            format_duration(report.scheduler.inference_worst),
            report.scheduler.budget_misses
        ),
        format!(
            "  uplink    delivered={} spooled={} evicted={} retries={} spool_len={}",
            report.uplink.delivered,
            report.uplink.spooled,
            report.uplink.spool_evicted,
            report.uplink.retries,
            report.uplink.spool_len
        ),
    ]
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::DensityBucket;
    use crate::pipeline::StopReason;
    use crate::schedule::SchedulerStats;
    use crate::uplink::UplinkSummary;

    #[test]
    fn plain_mode_never_uses_spinners() {
        assert!(!Ui::new(UiMode::Plain, true, false).pretty);
        assert!(!Ui::new(UiMode::Pretty, false, false).pretty);
        assert!(!Ui::new(UiMode::Auto, true, true).pretty);
        assert!(Ui::new(UiMode::Pretty, true, true).pretty);
        assert_eq!(UiMode::parse(Some("fancy")), UiMode::Auto);
    }

    #[test]
    fn report_mentions_uplink_totals() {
        let report = RunReport {
            frames_read: 20,
            frames_processed: 4,
            frames_skipped: 16,
            snapshots: 4,
            total_people: 30,
            peak_count: 9,
            mean_inference_ms: 12.5,
            stop_reason: StopReason::EndOfStream,
            uplink: UplinkSummary {
                delivered: 3,
                spooled: 1,
                ..UplinkSummary::default()
            },
            scheduler: SchedulerStats::default(),
        };
        let lines = report_lines(&report);
        assert!(lines[0].contains("EndOfStream"));
        assert!(lines[2].contains("mean=7.5"));
        assert!(lines[4].contains("delivered=3 spooled=1"));
    }

    #[test]
    fn snapshot_line_shows_missing_trend() {
        let line = snapshot_line(&CrowdSnapshot {
            source_id: "x".into(),
            seq: 0,
            timestamp: 0,
            count: 16,
            density: DensityBucket::High,
            trend: None,
            anomaly: true,
            processing_ms: 3,
            detections: Vec::new(),
        });
        assert_eq!(
            line,
            "seq=0 count=16 density=high trend=- anomaly=true processing=3ms"
        );
    }
}
