//! Bounded local spool for records the server did not take.
//!
//! Entries are kept for later inspection, never re-sent automatically. When the spool
//! is full the oldest entry is evicted to make room. Two stores:
//! - `InMemorySpool`: lost on exit
//! - `SqliteSpool`: survives restarts, readable with `spool_inspect`

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::VecDeque;
use std::path::Path;

use super::codec::PayloadEncoding;

/// Why a record ended up in the spool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpoolReason {
    /// The server answered with a non-retryable status.
    Rejected,
    /// Every delivery attempt failed.
    Exhausted,
    /// The pending queue was full.
    Overflow,
    /// Still pending when the flush deadline passed.
    Shutdown,
}

impl SpoolReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SpoolReason::Rejected => "rejected",
            SpoolReason::Exhausted => "exhausted",
            SpoolReason::Overflow => "overflow",
            SpoolReason::Shutdown => "shutdown",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "rejected" => Ok(SpoolReason::Rejected),
            "exhausted" => Ok(SpoolReason::Exhausted),
            "overflow" => Ok(SpoolReason::Overflow),
            "shutdown" => Ok(SpoolReason::Shutdown),
            other => Err(anyhow!("unknown spool reason '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpoolEntry {
    pub seq: u64,
    pub source_id: String,
    pub attempts: u32,
    pub reason: SpoolReason,
    pub spooled_at_ms: u64,
    pub last_error: Option<String>,
    pub encoding: PayloadEncoding,
    /// Encoded request body exactly as it would have been sent.
    pub payload: Vec<u8>,
}

pub trait Spool: Send {
    /// Append an entry, evicting the oldest ones past capacity. Returns how many
    /// entries were evicted.
    fn push(&mut self, entry: SpoolEntry) -> Result<usize>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All entries, oldest first.
    fn entries(&self) -> Result<Vec<SpoolEntry>>;

    fn capacity(&self) -> usize;
}

pub struct InMemorySpool {
    entries: VecDeque<SpoolEntry>,
    capacity: usize,
}

impl InMemorySpool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }
}

impl Spool for InMemorySpool {
    fn push(&mut self, entry: SpoolEntry) -> Result<usize> {
        let mut evicted = 0;
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            evicted += 1;
        }
        self.entries.push_back(entry);
        Ok(evicted)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.len())
    }

    fn entries(&self) -> Result<Vec<SpoolEntry>> {
        Ok(self.entries.iter().cloned().collect())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct SqliteSpool {
    conn: Connection,
    capacity: usize,
}

impl SqliteSpool {
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open spool database {}", path.display()))?;
        let mut spool = Self {
            conn,
            capacity: capacity.max(1),
        };
        spool.ensure_schema()?;
        Ok(spool)
    }

    /// Open an existing spool without modifying it.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("open spool database {} read-only", path.display()))?;
        Ok(Self {
            conn,
            capacity: usize::MAX,
        })
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS uplink_spool (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              seq INTEGER NOT NULL,
              source_id TEXT NOT NULL,
              attempts INTEGER NOT NULL,
              reason TEXT NOT NULL,
              spooled_at_ms INTEGER NOT NULL,
              last_error TEXT,
              encoding TEXT NOT NULL,
              payload BLOB NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl Spool for SqliteSpool {
    fn push(&mut self, entry: SpoolEntry) -> Result<usize> {
        let seq = i64::try_from(entry.seq).map_err(|_| anyhow!("seq exceeds i64 range"))?;
        let spooled_at = i64::try_from(entry.spooled_at_ms)
            .map_err(|_| anyhow!("spool timestamp exceeds i64 range"))?;
        let capacity = i64::try_from(self.capacity).unwrap_or(i64::MAX);

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO uplink_spool(seq, source_id, attempts, reason, spooled_at_ms, last_error, encoding, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                seq,
                entry.source_id,
                entry.attempts,
                entry.reason.as_str(),
                spooled_at,
                entry.last_error,
                entry.encoding.as_str(),
                entry.payload
            ],
        )?;
        let evicted = tx.execute(
            r#"
            DELETE FROM uplink_spool WHERE id IN (
              SELECT id FROM uplink_spool ORDER BY id ASC
              LIMIT max((SELECT COUNT(*) FROM uplink_spool) - ?1, 0)
            )
            "#,
            params![capacity],
        )?;
        tx.commit()?;
        Ok(evicted)
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM uplink_spool", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn entries(&self) -> Result<Vec<SpoolEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT seq, source_id, attempts, reason, spooled_at_ms, last_error, encoding, payload
            FROM uplink_spool ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Vec<u8>>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, source_id, attempts, reason, spooled_at, last_error, encoding, payload) =
                row?;
            entries.push(SpoolEntry {
                seq: seq as u64,
                source_id,
                attempts,
                reason: SpoolReason::parse(&reason)?,
                spooled_at_ms: spooled_at as u64,
                last_error,
                encoding: PayloadEncoding::parse(&encoding)?,
                payload,
            });
        }
        Ok(entries)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
