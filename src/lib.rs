//! Crowdwatch edge pipeline
//!
//! Counts people in a camera feed on the capture device and relays compact crowd
//! metadata to a remote aggregation server. Raw video never leaves the device.
//!
//! # Architecture
//!
//! Data flows one way:
//!
//! ```text
//! FrameSource -> FrameScheduler (gate) -> InferenceEngine -> Aggregator -> UplinkClient -> server
//! ```
//!
//! One pipeline thread drives acquisition and inference sequentially. The uplink runs
//! as an independent worker fed through a queue, so network latency never stalls
//! frame processing.
//!
//! # Module Structure
//!
//! - `frame`: Frame ownership (Frame, FrameMeta)
//! - `ingest`: Frame sources (camera, RTSP, MJPEG, local files, synthetic)
//! - `detect`: Inference engine and detector backends
//! - `schedule`: Frame-skip gate and CPU core budget
//! - `aggregate`: People count, density bucket, trend
//! - `uplink`: Wire codec, HTTP delivery, retry/backoff, spool
//! - `pipeline`: The orchestrator loop
//! - `config`, `error`, `ui`: Ambient plumbing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub mod aggregate;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod schedule;
pub mod ui;
pub mod uplink;

pub use aggregate::{Aggregator, CrowdSnapshot, DensityBucket, Trend};
pub use config::EdgeConfig;
pub use detect::{BoundingBox, Detection, InferenceEngine, ObjectClass};
pub use error::{exit_code_for, FailureKind, FatalError};
pub use frame::{Frame, FrameMeta};
pub use ingest::{open_source, Capture, FrameSource, SourceSpec, SourceStats};
pub use pipeline::{Pipeline, RunReport, StopReason};
pub use schedule::FrameScheduler;
pub use uplink::{UplinkClient, UplinkEvent, UplinkSummary};

/// Cooperative stop flag shared by the signal handler, the frame source and the loop.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on shutdown.
    ///
    /// Returns `false` if shutdown was requested before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
