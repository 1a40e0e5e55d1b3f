//! Bounded-concurrency fetch workers feeding one aggregator.
//!
//! Workers run on a private rayon pool sized to the effective concurrency,
//! so at most that many source calls are in flight. Each non-empty result
//! goes over a channel to the aggregator thread, which is the only code that
//! writes to the store during the run.

use polars::prelude::DataFrame;
use rayon::prelude::*;
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::aggregator::{Aggregator, FlushPolicy, FlushTotals};
use super::plan::FetchTask;
use crate::error::SyncError;
use crate::frame::Document;
use crate::progress::ProgressEvent;
use crate::provider::Provider;
use crate::source::SourceClient;
use crate::store::UpsertStore;

/// Everything a batch run's workers and aggregator share.
pub struct RunContext<'a> {
    pub provider: &'a dyn Provider,
    pub client: &'a dyn SourceClient,
    pub store: &'a dyn UpsertStore,
    pub extra_fields: Document,
    pub task_id: &'a str,
    pub concurrency: usize,
    pub progress_interval: usize,
    pub flush: FlushPolicy,
    pub max_recorded_failures: usize,
}

/// Task counters. One lock guards all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCounters {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub fetched_rows: usize,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunTotals {
    pub tasks: TaskCounters,
    pub writes: FlushTotals,
}

fn lock(counters: &Mutex<TaskCounters>) -> MutexGuard<'_, TaskCounters> {
    counters.lock().unwrap_or_else(|p| p.into_inner())
}

/// Fetch every task and write the results. Per-task failures are counted,
/// never returned; only a pool that cannot be built is an error.
pub fn run_tasks(
    ctx: &RunContext<'_>,
    tasks: Vec<FetchTask>,
    progress: Sender<ProgressEvent>,
) -> Result<RunTotals, SyncError> {
    let total = tasks.len();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.concurrency.max(1))
        .thread_name(|i| format!("sync-worker-{i}"))
        .build()
        .map_err(|e| SyncError::Pool(e.to_string()))?;

    let counters = Mutex::new(TaskCounters::default());
    let (tx, rx) = mpsc::channel::<DataFrame>();
    let interval = ctx.progress_interval.max(1);

    let writes = std::thread::scope(|scope| {
        let aggregator = Aggregator::new(
            ctx.store,
            ctx.provider.descriptor(),
            &ctx.extra_fields,
            ctx.flush,
        );
        let writer = scope.spawn(move || aggregator.run(rx));

        pool.install(|| {
            tasks
                .par_iter()
                .for_each_with((tx, progress), |(tx, progress), task| {
                    let raw = ctx.provider.batch_params(task);
                    let result = ctx.provider.fetch(ctx.client, &raw);

                    let mut c = lock(&counters);
                    c.processed += 1;
                    let frame = match result {
                        Ok(fetched) => {
                            c.succeeded += 1;
                            c.fetched_rows += fetched.frame.height();
                            (!fetched.is_empty()).then_some(fetched.frame)
                        }
                        Err(e) => {
                            c.failed += 1;
                            warn!(task = %task, error = %e, "fetch task failed");
                            if c.failures.len() < ctx.max_recorded_failures {
                                c.failures.push(format!("{task}: {e}"));
                            }
                            None
                        }
                    };
                    let report = (c.processed % interval == 0 || c.processed == total).then(|| {
                        ProgressEvent::Progress {
                            task_id: ctx.task_id.to_string(),
                            current: c.processed,
                            total,
                            message: format!(
                                "processed {}/{total} (succeeded {}, failed {})",
                                c.processed, c.succeeded, c.failed
                            ),
                        }
                    });
                    drop(c);

                    if let Some(frame) = frame {
                        if tx.send(frame).is_err() {
                            warn!(task = %task, "aggregator stopped, result dropped");
                        }
                    }
                    if let Some(event) = report {
                        let _ = progress.send(event);
                    }
                });
        });

        debug!(tasks = total, "all fetch tasks finished, draining");
        writer
            .join()
            .map_err(|_| SyncError::Pool("aggregator thread panicked".into()))
    })?;

    Ok(RunTotals {
        tasks: counters.into_inner().unwrap_or_else(|p| p.into_inner()),
        writes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BatchConfig, CollectionDescriptor};
    use crate::field_mapper::Params;
    use crate::frame::records_to_frame;
    use crate::provider::DescriptorProvider;
    use crate::source::SourceError;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    struct EchoSource;

    impl SourceClient for EchoSource {
        fn name(&self) -> &str {
            "echo"
        }

        fn call(&self, _function: &str, params: &Params) -> Result<DataFrame, SourceError> {
            let code = params.get("code").cloned().unwrap_or_default();
            if code == "bad" {
                return Err(SourceError::Other("boom".into()));
            }
            if code == "none" {
                return Ok(DataFrame::empty());
            }
            records_to_frame(&[json!({"code": code}).as_object().cloned().unwrap()])
                .map_err(|e| SourceError::Other(e.to_string()))
        }
    }

    fn provider() -> DescriptorProvider {
        DescriptorProvider::new(CollectionDescriptor {
            unique_keys: vec!["code".into()],
            batch: Some(BatchConfig::from_source("codes", "code")),
            ..CollectionDescriptor::new("target")
        })
    }

    #[test]
    fn counts_every_task_and_writes_results() {
        let store = MemoryStore::new();
        let p = provider();
        let ctx = RunContext {
            provider: &p,
            client: &EchoSource,
            store: &store,
            extra_fields: Document::new(),
            task_id: "t",
            concurrency: 2,
            progress_interval: 2,
            flush: FlushPolicy {
                row_threshold: 10,
                interval: Duration::from_secs(5),
            },
            max_recorded_failures: 1,
        };
        let tasks = ["a", "bad", "none", "b", "bad"]
            .iter()
            .map(|c| FetchTask::new(*c, None))
            .collect();
        let (ptx, prx) = mpsc::channel();
        let totals = run_tasks(&ctx, tasks, ptx).unwrap();

        assert_eq!(totals.tasks.processed, 5);
        assert_eq!(totals.tasks.succeeded, 3);
        assert_eq!(totals.tasks.failed, 2);
        assert_eq!(totals.tasks.failures.len(), 1);
        assert_eq!(totals.writes.inserted, 2);

        let events: Vec<ProgressEvent> = prx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Progress { current: 5, total: 5, .. })));
    }
}
