//! Delivery of crowd snapshots to the remote server.
//!
//! `UplinkClient::submit` hands a snapshot to a dedicated worker thread and returns at
//! once. The worker encodes it, POSTs it with retry and backoff, and moves records the
//! server will not take into a bounded spool. Frame processing never waits on the network.

pub mod backoff;
pub mod codec;
pub mod record;
pub mod spool;
pub mod transport;
mod worker;

use anyhow::{anyhow, Context, Result};
use log::info;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::aggregate::CrowdSnapshot;
use crate::config::{EdgeConfig, UplinkSettings};
use crate::ingest::redact_url;

pub use spool::{InMemorySpool, Spool, SpoolEntry, SpoolReason, SqliteSpool};
pub use transport::{HttpTransport, Transport, UplinkRequest};

/// Terminal outcome of a record, for observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UplinkEvent {
    Delivered {
        seq: u64,
        attempts: u32,
    },
    Spooled {
        seq: u64,
        attempts: u32,
        reason: SpoolReason,
    },
    SpoolEvicted {
        count: u64,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UplinkSummary {
    pub submitted: u64,
    pub delivered: u64,
    pub spooled: u64,
    pub spool_evicted: u64,
    /// Attempts beyond the first, summed over all records.
    pub retries: u64,
    /// Spool size when the worker stopped.
    pub spool_len: usize,
}

type WorkerOutput = (UplinkSummary, Box<dyn Spool>);

pub struct UplinkClient {
    tx: Option<Sender<CrowdSnapshot>>,
    handle: Option<JoinHandle<WorkerOutput>>,
    flush: worker::FlushDeadline,
    flush_grace: Duration,
}

impl UplinkClient {
    pub fn spawn(
        settings: &UplinkSettings,
        device_id: impl Into<String>,
        transport: Box<dyn Transport>,
        spool: Box<dyn Spool>,
        observer: Option<Sender<UplinkEvent>>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let flush = worker::FlushDeadline::default();
        let worker = worker::Worker::new(
            settings.clone(),
            device_id.into(),
            transport,
            spool,
            observer,
            flush.clone(),
        );
        let handle = thread::Builder::new()
            .name("uplink".to_string())
            .spawn(move || worker.run(rx))
            .context("spawn uplink worker")?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            flush,
            flush_grace: settings.flush_grace,
        })
    }

    /// HTTP transport to `uplink.server_url`, spooling to SQLite when a spool path is set.
    pub fn from_config(config: &EdgeConfig) -> Result<Self> {
        let settings = &config.uplink;
        let transport = HttpTransport::new(settings.server_url.clone(), settings.request_timeout);
        let spool: Box<dyn Spool> = match &settings.spool_path {
            Some(path) => Box::new(SqliteSpool::open(path, settings.uplink_spool_capacity)?),
            None => Box::new(InMemorySpool::new(settings.uplink_spool_capacity)),
        };
        info!(
            "uplink: {} (compression={}, retries={}, spool={})",
            redact_url(&settings.server_url),
            settings.compression_enabled,
            settings.max_uplink_retries,
            settings
                .spool_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "memory".to_string())
        );
        Self::spawn(
            settings,
            config.device_id.clone(),
            Box::new(transport),
            spool,
            None,
        )
    }

    /// Queue a snapshot for delivery. Never blocks on the network.
    pub fn submit(&self, snapshot: CrowdSnapshot) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("uplink already shut down"))?;
        tx.send(snapshot)
            .map_err(|_| anyhow!("uplink worker is not running"))
    }

    /// Stop accepting snapshots, flush within the grace period, and wait for the worker.
    pub fn shutdown(self) -> Result<UplinkSummary> {
        self.shutdown_with_spool().map(|(summary, _)| summary)
    }

    /// Like `shutdown`, also handing back the spool for inspection.
    pub fn shutdown_with_spool(mut self) -> Result<(UplinkSummary, Box<dyn Spool>)> {
        self.finish()?
            .ok_or_else(|| anyhow!("uplink worker already joined"))
    }

    fn finish(&mut self) -> Result<Option<WorkerOutput>> {
        if self.tx.take().is_some() {
            self.flush.arm(self.flush_grace);
        }
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map(Some)
                .map_err(|_| anyhow!("uplink worker panicked")),
            None => Ok(None),
        }
    }
}

impl Drop for UplinkClient {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::error!("{:#}", err);
        }
    }
}
