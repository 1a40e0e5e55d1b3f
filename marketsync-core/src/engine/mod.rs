//! Sync engine: single-call sync, full fetch, and incremental batch sync.
//!
//! Batch state flow:
//! `FetchingCandidateKeys → Diffing → Running → Draining → Flushing → Completed`,
//! with early exits to `Failed` (empty source collection, store read error)
//! and to `Completed` (nothing left to fetch).
//!
//! Caller errors (`MissingParameter`, `InvalidParameter`) are returned as
//! `Err`. Run-level failures come back as `Ok(RunOutcome)` with
//! `RunStatus::Failed`. Either way the progress sink sees exactly one
//! terminal notification per run.

pub mod aggregator;
pub mod plan;
pub mod scheduler;

use polars::prelude::DataFrame;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{EngineConfig, SyncConfig};
use crate::descriptor::current_year;
use crate::error::SyncError;
use crate::field_mapper::{value_to_string, RawParams};
use crate::frame::reorder_columns;
use crate::progress::{NoopProgress, ProgressEvent, ProgressSink};
use crate::provider::Provider;
use crate::source::SourceClient;
use crate::store::{UpsertStore, UpsertSummary};

use aggregator::FlushPolicy;
use plan::{candidate_tasks, diff, resolve_years, ExistingKeySet};
use scheduler::{run_tasks, RunContext};

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Summary of one run, returned to the caller and reported as the result of
/// the terminal progress notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub task_id: String,
    pub status: RunStatus,
    /// Tasks attempted. Always `succeeded + failed`.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Candidate tasks before the incremental diff, and how many it removed.
    pub candidates: usize,
    pub skipped: usize,
    pub fetched_rows: usize,
    pub saved_rows: usize,
    pub flushes: usize,
    pub failures: Vec<String>,
    pub message: String,
}

impl RunOutcome {
    fn new(task_id: &str, status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            processed: 0,
            succeeded: 0,
            failed: 0,
            inserted: 0,
            updated: 0,
            candidates: 0,
            skipped: 0,
            fetched_rows: 0,
            saved_rows: 0,
            flushes: 0,
            failures: Vec::new(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// The caller's `task_id`, or a fresh one derived from the collection name,
/// the clock and a process-wide sequence number.
fn task_id_for(collection: &str, raw: &RawParams) -> String {
    if let Some(id) = raw
        .get("task_id")
        .and_then(value_to_string)
        .filter(|id| !id.trim().is_empty())
    {
        return id;
    }
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = chrono::Local::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let digest = blake3::hash(format!("{collection}:{nanos}:{seq}").as_bytes());
    format!("{collection}-{}", &digest.to_hex()[..12])
}

/// Requested batch concurrency: the caller's `concurrency`, else `default`.
fn requested_concurrency(raw: &RawParams, default: usize) -> Result<usize, SyncError> {
    match raw.get("concurrency").and_then(value_to_string) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| SyncError::InvalidParameter {
                name: "concurrency".into(),
                reason: format!("'{value}' is not a positive integer"),
            }),
    }
}

/// Delivers progress events on its own thread so workers never wait on the sink.
struct Reporter {
    tx: Sender<ProgressEvent>,
    handle: JoinHandle<()>,
}

impl Reporter {
    fn spawn(sink: Arc<dyn ProgressSink>) -> Result<Self, SyncError> {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let handle = std::thread::Builder::new()
            .name("sync-progress".into())
            .spawn(move || {
                for event in rx {
                    event.deliver(sink.as_ref());
                }
            })
            .map_err(|e| SyncError::Pool(format!("failed to start progress reporter: {e}")))?;
        Ok(Self { tx, handle })
    }

    fn sender(&self) -> Sender<ProgressEvent> {
        self.tx.clone()
    }

    /// Wait until every queued event has been delivered.
    fn finish(self) {
        let Reporter { tx, handle } = self;
        drop(tx);
        if handle.join().is_err() {
            warn!("progress reporter panicked");
        }
    }
}

/// Runs single, full and batch syncs of one collection at a time against a
/// shared store, source client and progress sink.
pub struct SyncEngine {
    store: Arc<dyn UpsertStore>,
    client: Arc<dyn SourceClient>,
    progress: Arc<dyn ProgressSink>,
    config: EngineConfig,
    metadata: BTreeMap<String, String>,
}

impl SyncEngine {
    /// Engine with default tuning, the standard document metadata and no
    /// progress reporting.
    pub fn new(store: Arc<dyn UpsertStore>, client: Arc<dyn SourceClient>) -> Self {
        let defaults = SyncConfig::standard();
        Self {
            store,
            client,
            progress: Arc::new(NoopProgress),
            config: defaults.engine,
            metadata: defaults.metadata,
        }
    }

    /// Engine tuning and document metadata from a loaded configuration.
    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        self.config = config.engine.clone();
        self.metadata = config.metadata.clone();
        self
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Report runs to `progress` instead of discarding them.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Requested concurrency capped at half the smaller of the configured
    /// pool and the store's own connection capacity; never below one.
    pub fn effective_concurrency(&self, requested: usize) -> usize {
        let pool = self
            .config
            .max_pool_connections
            .min(self.store.max_connections());
        EngineConfig {
            max_pool_connections: pool,
            ..self.config.clone()
        }
        .effective_concurrency(requested)
    }

    fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            row_threshold: self.config.batch_size_threshold.max(1),
            interval: self.config.flush_interval().max(Duration::from_millis(1)),
        }
    }

    /// Batch sync when the collection has a batch source, otherwise one full
    /// fetch under task tracking.
    pub fn run(&self, provider: &dyn Provider, raw: &RawParams) -> Result<RunOutcome, SyncError> {
        if provider.descriptor().batch.is_some() {
            self.sync_batch(provider, raw)
        } else {
            self.sync_full(provider, raw)
        }
    }

    fn reject(&self, task_id: &str, err: SyncError) -> Result<RunOutcome, SyncError> {
        self.progress.fail(task_id, &err.to_string());
        Err(err)
    }

    fn finish(&self, outcome: RunOutcome) -> RunOutcome {
        match outcome.status {
            RunStatus::Completed => {
                self.progress
                    .complete(&outcome.task_id, &outcome.to_json(), &outcome.message);
            }
            RunStatus::Failed => {
                warn!(task_id = %outcome.task_id, "{}", outcome.message);
                self.progress.fail(&outcome.task_id, &outcome.message);
            }
        }
        outcome
    }

    /// Reorder by declared fields and upsert with the collection's extra fields.
    fn write(&self, provider: &dyn Provider, frame: DataFrame) -> Result<(UpsertSummary, usize), SyncError> {
        let descriptor = provider.descriptor();
        let frame = reorder_columns(frame, &descriptor.field_names())?;
        let rows = frame.height();
        let summary = self.store.upsert(
            &descriptor.name,
            &descriptor.unique_keys,
            &frame,
            &provider.extra_fields(&self.metadata),
        )?;
        Ok((summary, rows))
    }

    /// One source call with the caller's parameters, written as one upsert.
    /// An empty result is a successful run that changes nothing.
    pub fn sync_one(&self, provider: &dyn Provider, raw: &RawParams) -> Result<RunOutcome, SyncError> {
        let name = &provider.descriptor().name;
        let task_id = task_id_for(name, raw);
        self.progress.start(&task_id);

        let fetched = match provider.fetch(self.client.as_ref(), raw) {
            Ok(fetched) => fetched,
            Err(e) => return self.reject(&task_id, e),
        };

        let mut outcome = RunOutcome::new(&task_id, RunStatus::Completed, "");
        outcome.processed = 1;
        outcome.succeeded = 1;
        outcome.fetched_rows = fetched.frame.height();
        if fetched.is_empty() {
            outcome.message = format!("{name}: source returned no rows, nothing to save");
            info!(collection = %name, "{}", outcome.message);
            return Ok(self.finish(outcome));
        }

        let (summary, rows) = match self.write(provider, fetched.frame) {
            Ok(written) => written,
            Err(e) => return self.reject(&task_id, e),
        };
        outcome.inserted = summary.inserted;
        outcome.updated = summary.updated;
        outcome.saved_rows = rows;
        outcome.flushes = 1;
        outcome.message = format!(
            "{name}: saved {rows} rows (inserted {}, updated {})",
            summary.inserted, summary.updated
        );
        info!(collection = %name, rows, inserted = summary.inserted, updated = summary.updated, "sync complete");
        Ok(self.finish(outcome))
    }

    /// Fetch a collection without a batch source in one call. Unlike
    /// [`sync_one`](Self::sync_one), an empty result or a failed call fails
    /// the run.
    pub fn sync_full(&self, provider: &dyn Provider, raw: &RawParams) -> Result<RunOutcome, SyncError> {
        let name = &provider.descriptor().name;
        let task_id = task_id_for(name, raw);
        self.progress.start(&task_id);
        self.progress
            .update_progress(&task_id, 0, 1, &format!("fetching {name}"));

        let fetched = match provider.fetch(self.client.as_ref(), raw) {
            Ok(fetched) => fetched,
            Err(e) if e.is_caller_error() => return self.reject(&task_id, e),
            Err(e) => {
                let mut outcome = RunOutcome::new(&task_id, RunStatus::Failed, format!("{name}: {e}"));
                outcome.processed = 1;
                outcome.failed = 1;
                outcome.failures.push(e.to_string());
                return Ok(self.finish(outcome));
            }
        };

        let mut outcome = RunOutcome::new(&task_id, RunStatus::Completed, "");
        outcome.processed = 1;
        outcome.fetched_rows = fetched.frame.height();
        if fetched.is_empty() {
            outcome.status = RunStatus::Failed;
            outcome.failed = 1;
            outcome.message = format!("{name}: no data fetched");
            return Ok(self.finish(outcome));
        }
        outcome.succeeded = 1;

        match self.write(provider, fetched.frame) {
            Ok((summary, rows)) => {
                outcome.inserted = summary.inserted;
                outcome.updated = summary.updated;
                outcome.saved_rows = rows;
                outcome.flushes = 1;
                outcome.message = format!(
                    "{name}: saved {rows} rows (inserted {}, updated {})",
                    summary.inserted, summary.updated
                );
            }
            Err(e) => {
                outcome.status = RunStatus::Failed;
                outcome.failures.push(e.to_string());
                outcome.message = format!("{name}: fetched {} rows but saving failed: {e}", outcome.fetched_rows);
            }
        }
        Ok(self.finish(outcome))
    }

    /// Incremental batch sync over the collection's batch source.
    pub fn sync_batch(&self, provider: &dyn Provider, raw: &RawParams) -> Result<RunOutcome, SyncError> {
        let descriptor = provider.descriptor();
        let Some(batch) = &descriptor.batch else {
            return self.sync_full(provider, raw);
        };
        let name = &descriptor.name;
        let task_id = task_id_for(name, raw);
        self.progress.start(&task_id);

        let years = match resolve_years(batch, raw, current_year()) {
            Ok(years) => years,
            Err(e) => return self.reject(&task_id, e),
        };
        let default_concurrency = batch.concurrency.unwrap_or(self.config.default_concurrency);
        let requested = match requested_concurrency(raw, default_concurrency) {
            Ok(n) => n,
            Err(e) => return self.reject(&task_id, e),
        };

        let codes = match self.store.distinct(&batch.source_collection, &batch.source_field) {
            Ok(codes) => codes,
            Err(e) => {
                let message = format!(
                    "{name}: reading source collection '{}' failed: {e}",
                    batch.source_collection
                );
                return Ok(self.finish(RunOutcome::new(&task_id, RunStatus::Failed, message)));
            }
        };
        if codes.is_empty() {
            let message = SyncError::EmptySourceCollection(batch.source_collection.clone()).to_string();
            return Ok(self.finish(RunOutcome::new(&task_id, RunStatus::Failed, message)));
        }

        let candidates = candidate_tasks(&codes, years.as_deref());
        let existing = if batch.incremental_check_fields.is_empty() {
            None
        } else {
            match self.store.project(name, &batch.incremental_check_fields) {
                Ok(rows) => Some(ExistingKeySet::from_rows(
                    rows,
                    &batch.incremental_check_fields,
                    &batch.field_extractors,
                )),
                Err(e) => {
                    let message = format!("{name}: reading existing keys failed: {e}");
                    return Ok(self.finish(RunOutcome::new(&task_id, RunStatus::Failed, message)));
                }
            }
        };
        let plan = diff(candidates, existing.as_ref());
        info!(
            collection = %name,
            codes = codes.len(),
            candidates = plan.candidates,
            skipped = plan.skipped,
            pending = plan.tasks.len(),
            "batch plan ready"
        );

        if plan.tasks.is_empty() {
            let mut outcome = RunOutcome::new(
                &task_id,
                RunStatus::Completed,
                format!("{name}: all {} candidate tasks already synced", plan.candidates),
            );
            outcome.candidates = plan.candidates;
            outcome.skipped = plan.skipped;
            return Ok(self.finish(outcome));
        }

        let concurrency = self.effective_concurrency(requested);
        let total = plan.tasks.len();
        self.progress.update_progress(
            &task_id,
            0,
            total,
            &format!("{total} tasks pending, running with concurrency {concurrency}"),
        );

        let ctx = RunContext {
            provider,
            client: self.client.as_ref(),
            store: self.store.as_ref(),
            extra_fields: provider.extra_fields(&self.metadata),
            task_id: &task_id,
            concurrency,
            progress_interval: batch
                .progress_interval
                .unwrap_or(self.config.progress_interval),
            flush: self.flush_policy(),
            max_recorded_failures: self.config.max_recorded_failures,
        };
        let reporter = match Reporter::spawn(Arc::clone(&self.progress)) {
            Ok(reporter) => reporter,
            Err(e) => return self.reject(&task_id, e),
        };
        let totals = run_tasks(&ctx, plan.tasks, reporter.sender());
        reporter.finish();
        let totals = match totals {
            Ok(totals) => totals,
            Err(e) => return self.reject(&task_id, e),
        };

        let tasks = totals.tasks;
        let writes = totals.writes;
        let status = if tasks.succeeded == 0 && tasks.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let mut message = format!(
            "{name}: processed {}/{total} tasks, succeeded {}, failed {}; inserted {}, updated {} in {} flushes",
            tasks.processed, tasks.succeeded, tasks.failed, writes.inserted, writes.updated, writes.flushes
        );
        if plan.skipped > 0 {
            message.push_str(&format!("; skipped {} already synced", plan.skipped));
        }
        if writes.lost_rows > 0 {
            message.push_str(&format!("; {} rows could not be saved", writes.lost_rows));
        }

        let mut failures = tasks.failures;
        failures.extend(writes.errors);
        failures.truncate(self.config.max_recorded_failures);

        let outcome = RunOutcome {
            task_id: task_id.clone(),
            status,
            processed: tasks.processed,
            succeeded: tasks.succeeded,
            failed: tasks.failed,
            inserted: writes.inserted,
            updated: writes.updated,
            candidates: plan.candidates,
            skipped: plan.skipped,
            fetched_rows: tasks.fetched_rows,
            saved_rows: writes.saved_rows,
            flushes: writes.flushes,
            failures,
            message,
        };
        info!(collection = %name, "{}", outcome.message);
        Ok(self.finish(outcome))
    }
}
