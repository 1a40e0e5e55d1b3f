//! Progress reporting for sync runs.
//!
//! The engine never calls a sink from a worker thread; progress events go
//! through a channel to a reporter thread, so a slow sink cannot stall
//! fetches. Every run ends with exactly one `complete` or `fail`.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

/// Receives progress for runs, keyed by task id.
pub trait ProgressSink: Send + Sync {
    fn start(&self, task_id: &str);

    fn update_progress(&self, task_id: &str, current: usize, total: usize, message: &str);

    fn complete(&self, task_id: &str, result: &Value, message: &str);

    fn fail(&self, task_id: &str, message: &str);
}

impl<T: ProgressSink + ?Sized> ProgressSink for std::sync::Arc<T> {
    fn start(&self, task_id: &str) {
        (**self).start(task_id)
    }

    fn update_progress(&self, task_id: &str, current: usize, total: usize, message: &str) {
        (**self).update_progress(task_id, current, total, message)
    }

    fn complete(&self, task_id: &str, result: &Value, message: &str) {
        (**self).complete(task_id, result, message)
    }

    fn fail(&self, task_id: &str, message: &str) {
        (**self).fail(task_id, message)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn start(&self, _task_id: &str) {}
    fn update_progress(&self, _task_id: &str, _current: usize, _total: usize, _message: &str) {}
    fn complete(&self, _task_id: &str, _result: &Value, _message: &str) {}
    fn fail(&self, _task_id: &str, _message: &str) {}
}

/// Writes progress to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn start(&self, task_id: &str) {
        info!(task_id, "run started");
    }

    fn update_progress(&self, task_id: &str, current: usize, total: usize, message: &str) {
        info!(task_id, current, total, "{message}");
    }

    fn complete(&self, task_id: &str, _result: &Value, message: &str) {
        info!(task_id, "run complete: {message}");
    }

    fn fail(&self, task_id: &str, message: &str) {
        error!(task_id, "run failed: {message}");
    }
}

/// A progress notification as sent over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        task_id: String,
    },
    Progress {
        task_id: String,
        current: usize,
        total: usize,
        message: String,
    },
    Completed {
        task_id: String,
        result: Value,
        message: String,
    },
    Failed {
        task_id: String,
        message: String,
    },
}

impl ProgressEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ProgressEvent::Started { task_id }
            | ProgressEvent::Progress { task_id, .. }
            | ProgressEvent::Completed { task_id, .. }
            | ProgressEvent::Failed { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. })
    }

    /// Deliver this event to a sink.
    pub fn deliver(&self, sink: &dyn ProgressSink) {
        match self {
            ProgressEvent::Started { task_id } => sink.start(task_id),
            ProgressEvent::Progress {
                task_id,
                current,
                total,
                message,
            } => sink.update_progress(task_id, *current, *total, message),
            ProgressEvent::Completed {
                task_id,
                result,
                message,
            } => sink.complete(task_id, result, message),
            ProgressEvent::Failed { task_id, message } => sink.fail(task_id, message),
        }
    }
}

/// Forwards every notification into a channel. A closed receiver is ignored.
pub struct ChannelProgress {
    tx: Mutex<Sender<ProgressEvent>>,
}

impl ChannelProgress {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }

    fn send(&self, event: ProgressEvent) {
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let _ = tx.send(event);
    }
}

impl ProgressSink for ChannelProgress {
    fn start(&self, task_id: &str) {
        self.send(ProgressEvent::Started {
            task_id: task_id.to_string(),
        });
    }

    fn update_progress(&self, task_id: &str, current: usize, total: usize, message: &str) {
        self.send(ProgressEvent::Progress {
            task_id: task_id.to_string(),
            current,
            total,
            message: message.to_string(),
        });
    }

    fn complete(&self, task_id: &str, result: &Value, message: &str) {
        self.send(ProgressEvent::Completed {
            task_id: task_id.to_string(),
            result: result.clone(),
            message: message.to_string(),
        });
    }

    fn fail(&self, task_id: &str, message: &str) {
        self.send(ProgressEvent::Failed {
            task_id: task_id.to_string(),
            message: message.to_string(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// Latest known state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    /// 0.0 to 100.0
    pub progress: f64,
    pub message: String,
    pub result: Option<Value>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl TaskRecord {
    fn new(task_id: &str) -> Self {
        let now = Local::now();
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Pending,
            progress: 0.0,
            message: String::new(),
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// In-memory task table, queryable while runs are in flight.
#[derive(Debug, Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a pending task. An existing record is reset.
    pub fn create(&self, task_id: &str) -> TaskRecord {
        let record = TaskRecord::new(task_id);
        self.lock().insert(task_id.to_string(), record.clone());
        record
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().remove(task_id)
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Drop finished tasks last updated more than `max_age` ago; returns how
    /// many were dropped.
    pub fn cleanup_older_than(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Local::now()
            - ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::days(36500));
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, r| !(r.status.is_finished() && r.updated_at < cutoff));
        before - tasks.len()
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut TaskRecord)) {
        let mut tasks = self.lock();
        let record = tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskRecord::new(task_id));
        f(record);
        record.updated_at = Local::now();
    }
}

impl ProgressSink for TaskTracker {
    fn start(&self, task_id: &str) {
        self.update(task_id, |r| {
            r.status = TaskStatus::Running;
            r.progress = 0.0;
        });
    }

    fn update_progress(&self, task_id: &str, current: usize, total: usize, message: &str) {
        let percent = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64 * 100.0).min(100.0)
        };
        self.update(task_id, |r| {
            r.status = TaskStatus::Running;
            r.progress = percent;
            r.message = message.to_string();
        });
    }

    fn complete(&self, task_id: &str, result: &Value, message: &str) {
        self.update(task_id, |r| {
            r.status = TaskStatus::Success;
            r.progress = 100.0;
            r.message = message.to_string();
            r.result = Some(result.clone());
        });
    }

    fn fail(&self, task_id: &str, message: &str) {
        self.update(task_id, |r| {
            r.status = TaskStatus::Failed;
            r.message = message.to_string();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    #[test]
    fn tracker_follows_lifecycle() {
        let tracker = TaskTracker::new();
        assert_eq!(tracker.create("t1").status, TaskStatus::Pending);
        tracker.start("t1");
        tracker.update_progress("t1", 1, 4, "1/4");
        let mid = tracker.get("t1").unwrap();
        assert_eq!(mid.status, TaskStatus::Running);
        assert!((mid.progress - 25.0).abs() < f64::EPSILON);

        tracker.complete("t1", &json!({"inserted": 3}), "done");
        let done = tracker.get("t1").unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.result, Some(json!({"inserted": 3})));
    }

    #[test]
    fn tracker_records_failure_for_unknown_task() {
        let tracker = TaskTracker::new();
        tracker.fail("ghost", "boom");
        let rec = tracker.get("ghost").unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.message, "boom");
    }

    #[test]
    fn cleanup_keeps_running_tasks() {
        let tracker = TaskTracker::new();
        tracker.start("running");
        tracker.fail("failed", "x");
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(tracker.cleanup_older_than(std::time::Duration::ZERO), 1);
        assert!(tracker.get("running").is_some());
        assert!(tracker.remove("running").is_some());
        assert!(tracker.list().is_empty());
    }

    #[test]
    fn channel_sink_forwards_events() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelProgress::new(tx);
        sink.start("t");
        sink.update_progress("t", 1, 2, "half");
        sink.fail("t", "boom");
        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.task_id() == "t"));
        assert!(events[2].is_terminal());
    }

    #[test]
    fn events_deliver_to_sinks() {
        let tracker = TaskTracker::new();
        ProgressEvent::Completed {
            task_id: "t".into(),
            result: Value::Null,
            message: "ok".into(),
        }
        .deliver(&tracker);
        assert_eq!(tracker.get("t").unwrap().status, TaskStatus::Success);
    }
}
