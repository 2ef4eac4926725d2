use std::time::Instant;

use super::codec::EncodedPayload;
use super::spool::SpoolReason;
use crate::aggregate::CrowdSnapshot;

/// Delivery state of one record.
///
/// ```text
/// Pending -> InFlight -> Delivered
///    ^          |
///    +----------+ (retryable failure)
///               |
///               +-> Spooled
/// ```
///
/// A pending record can also go straight to `Spooled` when the queue overflows or the
/// flush deadline passes at shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    InFlight,
    Delivered,
    Spooled(SpoolReason),
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Delivered | RecordState::Spooled(_))
    }
}

/// A snapshot on its way to the server. Only the uplink worker mutates it.
#[derive(Debug)]
pub struct UplinkRecord {
    pub snapshot: CrowdSnapshot,
    pub payload: EncodedPayload,
    attempts: u32,
    next_retry_at: Option<Instant>,
    last_error: Option<String>,
    state: RecordState,
}

impl UplinkRecord {
    pub fn new(snapshot: CrowdSnapshot, payload: EncodedPayload) -> Self {
        Self {
            snapshot,
            payload,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            state: RecordState::Pending,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.state == RecordState::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Pending -> InFlight. Returns the 1-based attempt number.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        debug_assert_eq!(self.state, RecordState::Pending);
        self.state = RecordState::InFlight;
        self.attempts += 1;
        self.attempts
    }

    /// InFlight -> Pending, not before `at`.
    pub(crate) fn schedule_retry(&mut self, at: Instant, error: String) {
        debug_assert_eq!(self.state, RecordState::InFlight);
        self.state = RecordState::Pending;
        self.next_retry_at = Some(at);
        self.last_error = Some(error);
    }

    pub(crate) fn mark_delivered(&mut self) {
        debug_assert_eq!(self.state, RecordState::InFlight);
        self.state = RecordState::Delivered;
        self.next_retry_at = None;
    }

    pub(crate) fn mark_spooled(&mut self, reason: SpoolReason, error: Option<String>) {
        debug_assert!(!self.state.is_terminal());
        self.state = RecordState::Spooled(reason);
        self.next_retry_at = None;
        if error.is_some() {
            self.last_error = error;
        }
    }
}
