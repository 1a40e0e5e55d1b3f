//! The single writer of a batch run.
//!
//! Workers push result frames onto a channel; the aggregator buffers them and
//! flushes when the buffered row count reaches the threshold or the flush
//! interval has passed with rows pending. When every sender is gone it drains
//! the channel, flushes once more and returns its totals.

use polars::prelude::DataFrame;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::descriptor::CollectionDescriptor;
use crate::error::SyncError;
use crate::frame::{concat_frames, reorder_columns, Document};
use crate::store::{UpsertStore, UpsertSummary};

/// When to flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub row_threshold: usize,
    pub interval: Duration,
}

/// Totals of everything the aggregator wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushTotals {
    pub inserted: usize,
    pub updated: usize,
    pub saved_rows: usize,
    pub flushes: usize,
    /// Frames that could not be written even one at a time.
    pub failed_frames: usize,
    pub lost_rows: usize,
    pub errors: Vec<String>,
}

impl FlushTotals {
    fn record(&mut self, summary: &UpsertSummary, rows: usize) {
        self.inserted += summary.inserted;
        self.updated += summary.updated;
        self.saved_rows += rows;
    }
}

pub struct Aggregator<'a> {
    store: &'a dyn UpsertStore,
    descriptor: &'a CollectionDescriptor,
    extra_fields: &'a Document,
    field_order: Vec<String>,
    policy: FlushPolicy,
    pending: Vec<DataFrame>,
    pending_rows: usize,
    last_flush: Instant,
    totals: FlushTotals,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        store: &'a dyn UpsertStore,
        descriptor: &'a CollectionDescriptor,
        extra_fields: &'a Document,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            store,
            descriptor,
            extra_fields,
            field_order: descriptor.field_names(),
            policy,
            pending: Vec::new(),
            pending_rows: 0,
            last_flush: Instant::now(),
            totals: FlushTotals::default(),
        }
    }

    /// Consume the channel until every sender is dropped.
    pub fn run(mut self, rx: Receiver<DataFrame>) -> FlushTotals {
        loop {
            let wait = if self.pending.is_empty() {
                self.policy.interval
            } else {
                self.policy
                    .interval
                    .saturating_sub(self.last_flush.elapsed())
                    .max(Duration::from_millis(1))
            };

            match rx.recv_timeout(wait) {
                Ok(frame) => {
                    self.push(frame);
                    if self.pending_rows >= self.policy.row_threshold {
                        self.flush();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if !self.pending.is_empty() && self.last_flush.elapsed() >= self.policy.interval {
                debug!(collection = %self.descriptor.name, rows = self.pending_rows, "flush interval elapsed");
                self.flush();
            }
        }

        if !self.pending.is_empty() {
            self.flush();
        }
        self.totals
    }

    fn push(&mut self, frame: DataFrame) {
        if frame.height() == 0 {
            return;
        }
        self.pending_rows += frame.height();
        self.pending.push(frame);
    }

    fn write(&self, frame: DataFrame) -> Result<(UpsertSummary, usize), String> {
        let frame = reorder_columns(frame, &self.field_order).map_err(|e| e.to_string())?;
        let rows = frame.height();
        self.store
            .upsert(
                &self.descriptor.name,
                &self.descriptor.unique_keys,
                &frame,
                self.extra_fields,
            )
            .map(|summary| (summary, rows))
            .map_err(|e| e.to_string())
    }

    /// Write everything pending as one upsert. If that fails, retry each
    /// buffered frame on its own so one bad frame does not sink the rest.
    pub fn flush(&mut self) {
        let frames = std::mem::take(&mut self.pending);
        let rows = std::mem::replace(&mut self.pending_rows, 0);
        self.last_flush = Instant::now();
        if frames.is_empty() {
            return;
        }
        self.totals.flushes += 1;

        let combined = concat_frames(frames.clone())
            .map_err(|e| e.to_string())
            .and_then(|df| self.write(df));
        match combined {
            Ok((summary, written)) => {
                info!(
                    collection = %self.descriptor.name,
                    rows = written,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "flushed batch"
                );
                self.totals.record(&summary, written);
            }
            Err(reason) => {
                error!(
                    collection = %self.descriptor.name,
                    rows,
                    error = %reason,
                    "batch flush failed, saving frames one at a time"
                );
                self.totals
                    .errors
                    .push(SyncError::FlushFailure { rows, reason }.to_string());
                for frame in frames {
                    let height = frame.height();
                    match self.write(frame) {
                        Ok((summary, written)) => self.totals.record(&summary, written),
                        Err(e) => {
                            warn!(collection = %self.descriptor.name, rows = height, error = %e, "frame dropped");
                            self.totals.failed_frames += 1;
                            self.totals.lost_rows += height;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::records_to_frame;
    use crate::store::{MemoryStore, StoreError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn one_row(code: &str) -> DataFrame {
        records_to_frame(&[json!({"code": code, "v": 1}).as_object().cloned().unwrap()]).unwrap()
    }

    fn descriptor() -> CollectionDescriptor {
        CollectionDescriptor {
            unique_keys: vec!["code".into()],
            ..CollectionDescriptor::new("target")
        }
    }

    fn policy(rows: usize) -> FlushPolicy {
        FlushPolicy {
            row_threshold: rows,
            interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn threshold_triggers_flushes() {
        let store = MemoryStore::new();
        let d = descriptor();
        let extra = Document::new();
        let (tx, rx) = mpsc::channel();
        for code in ["1", "2", "3"] {
            tx.send(one_row(code)).unwrap();
        }
        drop(tx);
        let totals = Aggregator::new(&store, &d, &extra, policy(2)).run(rx);
        assert_eq!(totals.flushes, 2);
        assert_eq!(totals.inserted, 3);
        assert_eq!(totals.saved_rows, 3);
    }

    #[test]
    fn interval_flushes_pending_rows() {
        let store = MemoryStore::new();
        let d = descriptor();
        let extra = Document::new();
        let (tx, rx) = mpsc::channel();
        let policy = FlushPolicy {
            row_threshold: 1000,
            interval: Duration::from_millis(20),
        };
        let handle = std::thread::spawn(move || {
            tx.send(one_row("1")).unwrap();
            std::thread::sleep(Duration::from_millis(80));
            tx.send(one_row("2")).unwrap();
        });
        let totals = Aggregator::new(&store, &d, &extra, policy).run(rx);
        handle.join().unwrap();
        assert_eq!(totals.flushes, 2);
        assert_eq!(totals.inserted, 2);
    }

    /// Fails any upsert with more than one row.
    struct SmallWritesOnly {
        inner: MemoryStore,
        calls: AtomicUsize,
    }

    impl UpsertStore for SmallWritesOnly {
        fn upsert(
            &self,
            collection: &str,
            unique_keys: &[String],
            rows: &DataFrame,
            extra_fields: &Document,
        ) -> Result<UpsertSummary, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if rows.height() > 1 {
                return Err(StoreError::Unavailable("too many rows".into()));
            }
            self.inner.upsert(collection, unique_keys, rows, extra_fields)
        }

        fn distinct(&self, collection: &str, field: &str) -> Result<Vec<String>, StoreError> {
            self.inner.distinct(collection, field)
        }

        fn project(&self, collection: &str, fields: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
            self.inner.project(collection, fields)
        }
    }

    #[test]
    fn failed_flush_falls_back_to_single_frames() {
        let store = SmallWritesOnly {
            inner: MemoryStore::new(),
            calls: AtomicUsize::new(0),
        };
        let d = descriptor();
        let extra = Document::new();
        let (tx, rx) = mpsc::channel();
        tx.send(one_row("1")).unwrap();
        tx.send(one_row("2")).unwrap();
        drop(tx);
        let totals = Aggregator::new(&store, &d, &extra, policy(2)).run(rx);
        assert_eq!(totals.flushes, 1);
        assert_eq!(totals.inserted, 2);
        assert_eq!(totals.errors.len(), 1);
        assert_eq!(totals.failed_frames, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }
}
