//! Buffered multi-row inserter with a bounded queue.
//!
//! `add` never fails: past the soft cap new rows are dropped and counted
//! instead of blocking the transport thread, and a failed transaction
//! logs, drops the batch and keeps the writer alive. Both trade
//! durability for availability inside the bound set by the checkpoint
//! cadence.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::clock::SharedClock;

use super::{RawRow, Store};

/// Queue overflow bound as a multiple of the batch size.
const SOFT_CAP_FACTOR: usize = 10;
/// Smoothing factor for the write-duration moving average.
const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub flush_interval: time::Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: time::Duration::seconds(5),
        }
    }
}

/// Writer statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStats {
    pub rows_written: u64,
    pub batches: u64,
    pub dropped_rows: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_write: Option<OffsetDateTime>,
    /// Exponential moving average of the batch insert duration.
    pub avg_write_ms: f64,
    pub last_sample_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sample_timestamp: Option<OffsetDateTime>,
}

/// Queue state snapshot serialised into checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub pending_rows: usize,
    pub soft_cap: usize,
    pub dropped_rows: u64,
}

struct Buffer {
    pending: Vec<RawRow>,
    last_flush: OffsetDateTime,
}

/// Batched raw-sample persistence in front of the store.
pub struct BatchWriter {
    store: Arc<Store>,
    batch_size: usize,
    soft_cap: usize,
    flush_interval: time::Duration,
    clock: SharedClock,
    buffer: Mutex<Buffer>,
    stats: Mutex<WriterStats>,
}

impl BatchWriter {
    pub fn new(store: Arc<Store>, config: BatchWriterConfig, clock: SharedClock) -> Self {
        let batch_size = config.batch_size.max(1);
        let now = clock.now();
        Self {
            store,
            batch_size,
            soft_cap: batch_size * SOFT_CAP_FACTOR,
            flush_interval: config.flush_interval,
            clock,
            buffer: Mutex::new(Buffer {
                pending: Vec::with_capacity(batch_size),
                last_flush: now,
            }),
            stats: Mutex::new(WriterStats::default()),
        }
    }

    /// Enqueues rows, flushing when the batch fills or the interval
    /// elapses. Overflow drops the new rows and bumps the counter.
    pub fn add(&self, rows: impl IntoIterator<Item = RawRow>) {
        let mut buffer = self.buffer.lock();
        let mut overflow = 0u64;
        for row in rows {
            if buffer.pending.len() >= self.soft_cap {
                overflow += 1;
                continue;
            }
            buffer.pending.push(row);
        }
        if overflow > 0 {
            self.stats.lock().dropped_rows += overflow;
            debug!(overflow, "batch writer over soft cap, dropping samples");
        }
        let now = self.clock.now();
        let interval_elapsed = now - buffer.last_flush >= self.flush_interval;
        if buffer.pending.len() >= self.batch_size
            || (interval_elapsed && !buffer.pending.is_empty())
        {
            self.flush_buffer(&mut buffer, now);
        }
    }

    /// Drains everything now. Called on graceful stop.
    pub fn flush(&self) {
        let mut buffer = self.buffer.lock();
        let now = self.clock.now();
        if !buffer.pending.is_empty() {
            self.flush_buffer(&mut buffer, now);
        } else {
            buffer.last_flush = now;
        }
    }

    fn flush_buffer(&self, buffer: &mut Buffer, now: OffsetDateTime) {
        let batch: Vec<RawRow> = std::mem::take(&mut buffer.pending);
        buffer.last_flush = now;
        let last_ts = batch.last().map(|r| r.timestamp);
        let started = Instant::now();
        match self.store.insert_raw_batch(&batch) {
            Ok((written, last_id)) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                let mut stats = self.stats.lock();
                stats.rows_written += written;
                stats.batches += 1;
                stats.last_write = Some(now);
                stats.avg_write_ms = if stats.batches == 1 {
                    elapsed_ms
                } else {
                    EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * stats.avg_write_ms
                };
                if last_id.is_some() {
                    stats.last_sample_id = last_id;
                    stats.last_sample_timestamp = last_ts;
                }
            }
            Err(err) => {
                // Availability over durability: drop the batch, keep going.
                error!(%err, rows = batch.len(), "batch insert failed, dropping batch");
                let mut stats = self.stats.lock();
                stats.dropped_rows += batch.len() as u64;
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        self.stats.lock().clone()
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        let pending_rows = self.buffer.lock().pending.len();
        QueueSnapshot {
            pending_rows,
            soft_cap: self.soft_cap,
            dropped_rows: self.stats.lock().dropped_rows,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.lock().pending.len()
    }
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("batch_size", &self.batch_size)
            .field("soft_cap", &self.soft_cap)
            .finish()
    }
}
