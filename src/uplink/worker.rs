use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::backoff::Backoff;
use super::codec;
use super::record::UplinkRecord;
use super::spool::{Spool, SpoolEntry, SpoolReason};
use super::transport::{classify, Delivery, Transport, UplinkRequest};
use super::{UplinkEvent, UplinkSummary};
use crate::aggregate::CrowdSnapshot;
use crate::config::UplinkSettings;

/// Shutdown deadline shared by the client and its worker.
///
/// The client arms it before closing the channel, so the grace period runs from the
/// moment shutdown is requested rather than from when the worker notices.
#[derive(Clone, Debug, Default)]
pub(crate) struct FlushDeadline(Arc<Mutex<Option<Instant>>>);

impl FlushDeadline {
    /// Set the deadline to `now + grace` unless already set. Returns the deadline in force.
    pub(crate) fn arm(&self, grace: Duration) -> Instant {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *slot.get_or_insert_with(|| Instant::now() + grace)
    }

    pub(crate) fn get(&self) -> Option<Instant> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the pending queue. One record is in flight at a time, always the oldest.
pub(crate) struct Worker {
    settings: UplinkSettings,
    device_id: String,
    transport: Box<dyn Transport>,
    spool: Box<dyn Spool>,
    observer: Option<Sender<UplinkEvent>>,
    pending: VecDeque<UplinkRecord>,
    summary: UplinkSummary,
    backoff: Backoff,
    flush: FlushDeadline,
}

impl Worker {
    pub(crate) fn new(
        settings: UplinkSettings,
        device_id: String,
        transport: Box<dyn Transport>,
        spool: Box<dyn Spool>,
        observer: Option<Sender<UplinkEvent>>,
        flush: FlushDeadline,
    ) -> Self {
        let backoff = Backoff::from_settings(&settings);
        Self {
            settings,
            device_id,
            transport,
            spool,
            observer,
            pending: VecDeque::new(),
            summary: UplinkSummary::default(),
            backoff,
            flush,
        }
    }

    /// Runs until the sending side is dropped and the queue is flushed or the flush
    /// grace has passed.
    pub(crate) fn run(mut self, rx: Receiver<CrowdSnapshot>) -> (UplinkSummary, Box<dyn Spool>) {
        let mut deadline: Option<Instant> = None;

        loop {
            if deadline.is_none() {
                self.receive(&rx, &mut deadline);
            }

            if let Some(limit) = deadline {
                if self.pending.is_empty() {
                    break;
                }
                let now = Instant::now();
                if now >= limit {
                    let left = self.pending.len();
                    warn!(
                        "uplink: flush grace expired with {} record(s) pending; spooling",
                        left
                    );
                    self.spool_all(SpoolReason::Shutdown);
                    break;
                }
                let due = self
                    .pending
                    .front()
                    .and_then(|head| head.next_retry_at())
                    .unwrap_or(now);
                if due > now {
                    thread::sleep(due.min(limit) - now);
                    continue;
                }
            }

            self.attempt_head();
        }

        match self.spool.len() {
            Ok(len) => self.summary.spool_len = len,
            Err(err) => warn!("uplink: could not read spool size: {:#}", err),
        }
        info!(
            "uplink: stopped (submitted={}, delivered={}, spooled={}, evicted={})",
            self.summary.submitted,
            self.summary.delivered,
            self.summary.spooled,
            self.summary.spool_evicted
        );
        (self.summary, self.spool)
    }

    fn receive(&mut self, rx: &Receiver<CrowdSnapshot>, deadline: &mut Option<Instant>) {
        let received = match self.pending.front() {
            None => rx.recv().ok(),
            Some(head) => {
                let wait = head
                    .next_retry_at()
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::ZERO);
                if wait.is_zero() {
                    match rx.try_recv() {
                        Ok(snapshot) => Some(snapshot),
                        Err(TryRecvError::Empty) => return,
                        Err(TryRecvError::Disconnected) => None,
                    }
                } else {
                    match rx.recv_timeout(wait) {
                        Ok(snapshot) => Some(snapshot),
                        Err(RecvTimeoutError::Timeout) => return,
                        Err(RecvTimeoutError::Disconnected) => None,
                    }
                }
            }
        };

        let Some(snapshot) = received else {
            self.begin_flush(deadline);
            return;
        };
        self.enqueue(snapshot);

        loop {
            match rx.try_recv() {
                Ok(snapshot) => self.enqueue(snapshot),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.begin_flush(deadline);
                    return;
                }
            }
        }
    }

    fn begin_flush(&self, deadline: &mut Option<Instant>) {
        if !self.pending.is_empty() {
            info!(
                "uplink: flushing {} pending record(s) within {:?}",
                self.pending.len(),
                self.settings.flush_grace
            );
        }
        *deadline = Some(self.flush.arm(self.settings.flush_grace));
    }

    fn enqueue(&mut self, snapshot: CrowdSnapshot) {
        self.summary.submitted += 1;
        let payload = match codec::encode(&snapshot, self.settings.compression_enabled) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    "uplink: dropping snapshot seq={} that failed to encode: {:#}",
                    snapshot.seq, err
                );
                return;
            }
        };

        while self.pending.len() >= self.settings.queue_capacity.max(1) {
            if let Some(oldest) = self.pending.pop_front() {
                self.spool_record(oldest, SpoolReason::Overflow, None);
            }
        }
        self.pending.push_back(UplinkRecord::new(snapshot, payload));
    }

    fn attempt_head(&mut self) {
        let now = Instant::now();
        let Some(head) = self.pending.front_mut() else {
            return;
        };
        if !head.is_due(now) {
            return;
        }
        // Once shutdown is requested an attempt may only use what is left of the grace.
        let timeout = self
            .flush
            .get()
            .map(|limit| limit.saturating_duration_since(now));
        if timeout.is_some_and(|left| left.is_zero()) {
            return;
        }

        let attempt = head.begin_attempt();
        if attempt > 1 {
            self.summary.retries += 1;
        }
        let request = UplinkRequest {
            body: &head.payload.body,
            encoding: head.payload.encoding,
            device_id: &self.device_id,
            attempt,
            timeout,
        };
        let outcome = classify(&self.transport.post(&request));
        let seq = head.snapshot.seq;

        match outcome {
            Delivery::Delivered => {
                head.mark_delivered();
                self.pending.pop_front();
                self.summary.delivered += 1;
                debug!("uplink: seq={} delivered on attempt {}", seq, attempt);
                self.emit(UplinkEvent::Delivered {
                    seq,
                    attempts: attempt,
                });
            }
            Delivery::Retry(error) if attempt >= self.settings.max_uplink_retries => {
                warn!(
                    "uplink: seq={} failed {} time(s), giving up: {}",
                    seq, attempt, error
                );
                if let Some(record) = self.pending.pop_front() {
                    self.spool_record(record, SpoolReason::Exhausted, Some(error));
                }
            }
            Delivery::Retry(error) => {
                let delay = self.backoff.delay(attempt);
                debug!(
                    "uplink: seq={} attempt {} failed ({}); retry in {:?}",
                    seq, attempt, error, delay
                );
                head.schedule_retry(Instant::now() + delay, error);
            }
            Delivery::Rejected(error) => {
                warn!("uplink: seq={} rejected by server: {}", seq, error);
                if let Some(record) = self.pending.pop_front() {
                    self.spool_record(record, SpoolReason::Rejected, Some(error));
                }
            }
        }
    }

    fn spool_all(&mut self, reason: SpoolReason) {
        while let Some(record) = self.pending.pop_front() {
            self.spool_record(record, reason, None);
        }
    }

    fn spool_record(&mut self, mut record: UplinkRecord, reason: SpoolReason, error: Option<String>) {
        record.mark_spooled(reason, error);
        let seq = record.snapshot.seq;
        let attempts = record.attempts();
        let entry = SpoolEntry {
            seq,
            source_id: record.snapshot.source_id.clone(),
            attempts,
            reason,
            spooled_at_ms: crate::now_ms(),
            last_error: record.last_error().map(str::to_string),
            encoding: record.payload.encoding,
            payload: record.payload.body,
        };

        match self.spool.push(entry) {
            Ok(evicted) => {
                self.summary.spooled += 1;
                if evicted > 0 {
                    self.summary.spool_evicted += evicted as u64;
                    warn!("uplink: spool full, evicted {} oldest entr(ies)", evicted);
                    self.emit(UplinkEvent::SpoolEvicted {
                        count: evicted as u64,
                    });
                }
                self.emit(UplinkEvent::Spooled {
                    seq,
                    attempts,
                    reason,
                });
            }
            Err(err) => warn!("uplink: failed to spool seq={}: {:#}", seq, err),
        }
    }

    fn emit(&self, event: UplinkEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }
}
