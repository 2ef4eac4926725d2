//! Reconnecting wrapper for live streams.
//!
//! A `StreamSource` owns one `StreamReader` (RTSP, MJPEG or camera) and hides
//! transient read failures from the pipeline: on a failed or ended read it drops the
//! connection and reopens it with capped exponential backoff. When the attempt budget
//! is spent the source reports a frame-source failure and the pipeline stops.

use anyhow::Result;
use std::time::{Duration, Instant};

use super::{Capture, FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::error::FatalError;
use crate::frame::Frame;
use crate::ShutdownSignal;

/// One decoded RGB24 image handed up by a reader.
pub(crate) struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Device- or protocol-specific half of a live source.
pub(crate) trait StreamReader {
    fn open(&mut self) -> Result<()>;

    /// `Ok(None)` means the remote side ended the stream.
    fn read(&mut self) -> Result<Option<RawImage>>;

    fn close(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &SourceSettings) -> Self {
        Self {
            max_attempts: settings.reconnect_attempts.max(1),
            base: settings.reconnect_base,
            max: settings.reconnect_max,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

pub struct StreamSource {
    label: String,
    reader: Box<dyn StreamReader>,
    policy: ReconnectPolicy,
    shutdown: ShutdownSignal,
    connected: bool,
    next_seq: u64,
    reconnects: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl StreamSource {
    pub(crate) fn new(
        label: String,
        reader: Box<dyn StreamReader>,
        policy: ReconnectPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            label,
            reader,
            policy,
            shutdown,
            connected: false,
            next_seq: 0,
            reconnects: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn drop_connection(&mut self, reason: String) {
        log::warn!("StreamSource: {} lost: {}", self.label, reason);
        self.reader.close();
        self.connected = false;
        self.last_error = Some(reason);
    }

    /// Reopen the stream. `Ok(false)` means shutdown was requested while waiting.
    fn reconnect(&mut self) -> Result<bool> {
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay(attempt);
            log::info!(
                "StreamSource: reconnecting to {} in {:?} (attempt {}/{})",
                self.label,
                delay,
                attempt,
                self.policy.max_attempts
            );
            if !self.shutdown.sleep(delay) {
                return Ok(false);
            }
            match self.reader.open() {
                Ok(()) => {
                    self.connected = true;
                    self.reconnects += 1;
                    self.last_error = None;
                    log::info!("StreamSource: reconnected to {}", self.label);
                    return Ok(true);
                }
                Err(err) => {
                    log::warn!(
                        "StreamSource: reconnect to {} failed: {:#}",
                        self.label,
                        err
                    );
                    self.last_error = Some(format!("{:#}", err));
                }
            }
        }
        Err(FatalError::frame_source(format!(
            "{} unreachable after {} reconnect attempts: {}",
            self.label,
            self.policy.max_attempts,
            self.last_error.as_deref().unwrap_or("unknown error")
        ))
        .into())
    }
}

impl FrameSource for StreamSource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn connect(&mut self) -> Result<()> {
        match self.reader.open() {
            Ok(()) => {
                self.connected = true;
                log::info!("StreamSource: connected to {}", self.label);
                Ok(())
            }
            Err(err) => {
                self.drop_connection(format!("{:#}", err));
                if self.reconnect()? {
                    Ok(())
                } else {
                    Err(FatalError::frame_source(format!(
                        "shutdown requested before {} connected",
                        self.label
                    ))
                    .into())
                }
            }
        }
    }

    fn next_frame(&mut self) -> Result<Capture> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(Capture::EndOfStream);
            }
            if !self.connected && !self.reconnect()? {
                return Ok(Capture::EndOfStream);
            }
            match self.reader.read() {
                Ok(Some(image)) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.last_frame_at = Some(Instant::now());
                    return Ok(Capture::Frame(Frame::new(
                        image.pixels,
                        image.width,
                        image.height,
                        seq,
                        crate::now_ms(),
                    )));
                }
                Ok(None) => self.drop_connection("stream ended".to_string()),
                Err(err) => self.drop_connection(format!("{:#}", err)),
            }
        }
    }

    fn is_healthy(&self) -> bool {
        if !self.connected {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= self.policy.max.max(Duration::from_secs(2)),
            None => true,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            source: self.label.clone(),
            frames_captured: self.next_seq,
            reconnects: self.reconnects,
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{failure_kind, FailureKind};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    enum Step {
        Frame,
        Fail,
        Ended,
    }

    /// Reader that replays scripted open and read outcomes.
    struct ScriptedReader {
        reads: VecDeque<Step>,
        /// `false` entries fail the matching open. Opens succeed once exhausted.
        opens_ok: VecDeque<bool>,
        opens: Arc<AtomicU32>,
    }

    impl StreamReader for ScriptedReader {
        fn open(&mut self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.opens_ok.pop_front().unwrap_or(true) {
                Ok(())
            } else {
                anyhow::bail!("connection refused")
            }
        }

        fn read(&mut self) -> Result<Option<RawImage>> {
            match self.reads.pop_front() {
                Some(Step::Frame) => Ok(Some(RawImage {
                    pixels: vec![0u8; 2 * 2 * 3],
                    width: 2,
                    height: 2,
                })),
                Some(Step::Fail) => anyhow::bail!("read timed out"),
                Some(Step::Ended) | None => Ok(None),
            }
        }

        fn close(&mut self) {}
    }

    fn source(reads: Vec<Step>, opens_ok: Vec<bool>, max_attempts: u32) -> (StreamSource, Arc<AtomicU32>) {
        let opens = Arc::new(AtomicU32::new(0));
        let reader = ScriptedReader {
            reads: reads.into(),
            opens_ok: opens_ok.into(),
            opens: opens.clone(),
        };
        let policy = ReconnectPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        };
        let src = StreamSource::new(
            "rtsp://test/stream".to_string(),
            Box::new(reader),
            policy,
            ShutdownSignal::new(),
        );
        (src, opens)
    }

    fn expect_frame(capture: Capture) -> Frame {
        match capture {
            Capture::Frame(frame) => frame,
            Capture::EndOfStream => panic!("expected a frame"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(4), Duration::from_millis(4000));
        assert_eq!(policy.delay(6), Duration::from_secs(8));
        assert_eq!(policy.delay(40), Duration::from_secs(8));
    }

    #[test]
    fn transient_read_failure_is_hidden_from_caller() -> Result<()> {
        let (mut src, opens) = source(vec![Step::Frame, Step::Fail, Step::Frame], vec![], 3);
        src.connect()?;

        let first = expect_frame(src.next_frame()?);
        let second = expect_frame(src.next_frame()?);
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(src.stats().reconnects, 1);
        assert_eq!(src.stats().frames_captured, 2);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn initial_connect_retries_before_giving_up() -> Result<()> {
        let (mut src, opens) = source(vec![Step::Frame], vec![false, false], 3);
        src.connect()?;
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        expect_frame(src.next_frame()?);
        Ok(())
    }

    #[test]
    fn unreachable_at_startup_is_a_frame_source_failure() {
        let (mut src, opens) = source(vec![], vec![false; 10], 2);
        let err = src.connect().unwrap_err();
        assert_eq!(failure_kind(&err), Some(FailureKind::FrameSource));
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert!(!src.is_healthy());
    }

    #[test]
    fn spent_reconnect_budget_surfaces_from_next_frame() -> Result<()> {
        let (mut src, _) = source(
            vec![Step::Frame, Step::Ended],
            vec![true, false, false],
            2,
        );
        src.connect()?;
        expect_frame(src.next_frame()?);

        let err = src.next_frame().unwrap_err();
        assert_eq!(failure_kind(&err), Some(FailureKind::FrameSource));
        assert!(src.stats().last_error.is_some());
        Ok(())
    }

    #[test]
    fn shutdown_ends_the_stream() -> Result<()> {
        let (mut src, _) = source(vec![Step::Frame, Step::Frame], vec![], 3);
        src.connect()?;
        src.shutdown.trigger();
        assert!(matches!(src.next_frame()?, Capture::EndOfStream));
        Ok(())
    }
}
