//! Pipeline orchestrator.
//!
//! One thread reads frames, lets the scheduler pick which ones to infer, aggregates
//! detections into snapshots and hands them to the uplink. Delivery runs on the uplink's
//! own thread, so a slow server never stalls frame processing.

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use crate::aggregate::{Aggregator, CrowdSnapshot};
use crate::config::EdgeConfig;
use crate::detect::InferenceEngine;
use crate::error::{FailureKind, FatalError};
use crate::ingest::{Capture, FrameSource};
use crate::schedule::{FrameScheduler, SchedulerStats};
use crate::uplink::{UplinkClient, UplinkSummary};
use crate::ShutdownSignal;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Shutdown,
}

/// Totals for one run, returned once the uplink has flushed.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub frames_read: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub snapshots: u64,
    pub total_people: u64,
    pub peak_count: u32,
    pub mean_inference_ms: f64,
    pub stop_reason: StopReason,
    pub uplink: UplinkSummary,
    pub scheduler: SchedulerStats,
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    engine: InferenceEngine,
    scheduler: FrameScheduler,
    aggregator: Aggregator,
    uplink: UplinkClient,
    shutdown: ShutdownSignal,
    subscribers: Vec<Sender<CrowdSnapshot>>,
}

#[derive(Default)]
struct Totals {
    frames_read: u64,
    snapshots: u64,
    total_people: u64,
    peak_count: u32,
}

impl Pipeline {
    pub fn new(
        config: &EdgeConfig,
        source: Box<dyn FrameSource>,
        engine: InferenceEngine,
        uplink: UplinkClient,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            engine,
            scheduler: FrameScheduler::new(&config.schedule, config.source.target_fps),
            aggregator: Aggregator::new(config.aggregate.clone(), config.device_id.clone()),
            uplink,
            shutdown,
            subscribers: Vec::new(),
        }
    }

    /// Receive every snapshot the pipeline produces. Dropping the receiver unsubscribes.
    pub fn subscribe(&mut self) -> Receiver<CrowdSnapshot> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Run until end of stream, shutdown, or a fatal source failure.
    ///
    /// The uplink is flushed on every exit path before this returns.
    pub fn run(mut self) -> Result<RunReport> {
        let mut totals = Totals::default();

        if let Err(err) = self.source.connect() {
            self.uplink.shutdown()?;
            return Err(FatalError::wrap(FailureKind::FrameSource, err));
        }
        info!(
            "pipeline: {} -> {} backend, processing 1 of every {} frame(s)",
            self.source.describe(),
            self.engine.backend_name(),
            self.scheduler.interval()
        );

        let mut last_health_log = Instant::now();
        let outcome = loop {
            if self.shutdown.is_triggered() {
                break Ok(StopReason::Shutdown);
            }

            match self.source.next_frame() {
                Ok(Capture::Frame(frame)) => {
                    totals.frames_read += 1;
                    if self.scheduler.should_process() {
                        let started = Instant::now();
                        let detections = self.engine.detect(&frame);
                        self.scheduler.record_inference(started.elapsed());
                        let meta = frame.meta();
                        drop(frame);

                        let snapshot =
                            self.aggregator
                                .aggregate(&detections, &meta, started.elapsed());
                        self.publish(snapshot, &mut totals)?;
                    }
                }
                Ok(Capture::EndOfStream) => {
                    break Ok(if self.shutdown.is_triggered() {
                        StopReason::Shutdown
                    } else {
                        StopReason::EndOfStream
                    });
                }
                Err(err) => break Err(err),
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health(&totals);
                last_health_log = Instant::now();
            }
        };

        let stats = self.scheduler.stats();
        let source_stats = self.source.stats();
        let Pipeline { uplink, .. } = self;
        let uplink = uplink.shutdown()?;

        let stop_reason = match outcome {
            Ok(reason) => reason,
            Err(err) => {
                warn!(
                    "pipeline: {} failed after {} frame(s)",
                    source_stats.source, source_stats.frames_captured
                );
                return Err(FatalError::wrap(FailureKind::FrameSource, err));
            }
        };

        let report = RunReport {
            frames_read: totals.frames_read,
            frames_processed: stats.processed,
            frames_skipped: stats.skipped,
            snapshots: totals.snapshots,
            total_people: totals.total_people,
            peak_count: totals.peak_count,
            mean_inference_ms: stats.mean_inference().as_secs_f64() * 1000.0,
            stop_reason,
            uplink,
            scheduler: stats,
        };
        info!(
            "pipeline: stopped ({:?}) read={} processed={} snapshots={} delivered={} spooled={}",
            report.stop_reason,
            report.frames_read,
            report.frames_processed,
            report.snapshots,
            report.uplink.delivered,
            report.uplink.spooled
        );
        Ok(report)
    }

    fn publish(&mut self, snapshot: CrowdSnapshot, totals: &mut Totals) -> Result<()> {
        totals.snapshots += 1;
        totals.total_people += snapshot.count as u64;
        totals.peak_count = totals.peak_count.max(snapshot.count);
        debug!(
            "pipeline: seq={} count={} density={} trend={} anomaly={} {}ms",
            snapshot.seq,
            snapshot.count,
            snapshot.density.as_str(),
            snapshot.trend.map(|t| t.as_str()).unwrap_or("-"),
            snapshot.anomaly,
            snapshot.processing_ms
        );

        self.subscribers
            .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
        self.uplink.submit(snapshot)
    }

    fn log_health(&self, totals: &Totals) {
        let stats = self.scheduler.stats();
        let source = self.source.stats();
        info!(
            "pipeline health: source={} healthy={} reconnects={} read={} processed={} skipped={} snapshots={} budget_misses={}",
            source.source,
            self.source.is_healthy(),
            source.reconnects,
            totals.frames_read,
            stats.processed,
            stats.skipped,
            totals.snapshots,
            stats.budget_misses
        );
    }
}
