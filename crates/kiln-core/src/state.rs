// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-build in-memory state.
//!
//! A [`BuildState`] is the single record shared by everything that touches
//! one build: the orchestrator, the per-task supervisors, the executors,
//! and the HTTP handlers that ingest worker logs and result callbacks.
//! One `RwLock` guards all internal maps and counters; user-visible log
//! lines flow through a bounded channel that the streaming endpoint
//! drains.
//!
//! The log channel is closed by [`BuildState::finish`] while producers may
//! still be in flight: the sender lives under the state's lock and
//! `finish` takes it, so a post-close producer simply finds nothing to
//! send on. Overflow is dropped rather than blocking — losing a log line
//! is preferable to stalling a build.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bound of the per-build log channel.
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Severity of a user-visible log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Debug => f.write_str("debug"),
            Level::Info => f.write_str("info"),
            Level::Warn => f.write_str("warn"),
            Level::Error => f.write_str("error"),
        }
    }
}

/// One line of the client-facing build log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: Level,
    pub message: String,
}

impl LogEntry {
    pub fn now(level: Level, message: impl Into<String>) -> Self {
        Self { ts: Utc::now(), level, message: message.into() }
    }
}

/// A worker's result callback payload, immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub arch: String,
    pub image_digest: String,
    pub success: bool,
    pub error: String,
}

/// Shape flags fixed when the build plan is derived.
#[derive(Debug, Clone, Default)]
pub struct BuildShape {
    /// At most one pushing task: no manifest list is assembled.
    pub is_single_arch: bool,
    /// The manifest-list target for multi-arch builds.
    pub global_destination: String,
    /// Two pushing tasks share an arch: task ids carry an index suffix.
    pub has_duplicate_arch: bool,
}

/// Outcome of recording a result callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetResultOutcome {
    Recorded,
    /// Same task id, same digest: idempotent retry, dropped.
    DuplicateIgnored,
    /// Same task id, different digest: rejected, the first value stands.
    DigestConflict { existing_digest: String },
}

#[derive(Default)]
struct Inner {
    log_tx: Option<mpsc::Sender<LogEntry>>,
    handle_by_task: HashMap<String, String>,
    task_by_handle: HashMap<String, String>,
    ingest_started: HashSet<String>,
    ingest_done: HashSet<String>,
    ingest_done_count: usize,
    results: HashMap<String, TaskResult>,
    results_received: usize,
    first_error: Option<String>,
    finished: bool,
    closed: bool,
}

/// The central per-build record. See the module docs for the locking and
/// channel-close discipline.
pub struct BuildState {
    id: String,
    total_tasks: usize,
    shape: BuildShape,
    done: CancellationToken,
    log_rx: Mutex<Option<mpsc::Receiver<LogEntry>>>,
    inner: RwLock<Inner>,
}

impl BuildState {
    /// Creates a build state expecting `total_tasks` worker callbacks.
    ///
    /// The id is the routing key for log ingest and result callbacks and
    /// must be non-empty.
    pub fn new(id: impl Into<String>, total_tasks: usize, shape: BuildShape) -> Self {
        let id = id.into();
        assert!(!id.trim().is_empty(), "build state id cannot be empty");

        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        Self {
            id,
            total_tasks,
            shape,
            done: CancellationToken::new(),
            log_rx: Mutex::new(Some(log_rx)),
            inner: RwLock::new(Inner { log_tx: Some(log_tx), ..Inner::default() }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn total_tasks(&self) -> usize {
        self.total_tasks
    }

    pub fn is_single_arch(&self) -> bool {
        self.shape.is_single_arch
    }

    pub fn global_destination(&self) -> &str {
        &self.shape.global_destination
    }

    pub fn has_duplicate_arch(&self) -> bool {
        self.shape.has_duplicate_arch
    }

    /// Completion signal, cancelled exactly once by [`finish`].
    ///
    /// [`finish`]: BuildState::finish
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Hands the log receiver to its single consumer. Subsequent calls
    /// return `None`.
    pub fn take_log_stream(&self) -> Option<mpsc::Receiver<LogEntry>> {
        self.log_rx.lock().take()
    }

    /// Appends a log line without blocking. Entries are dropped silently
    /// when the channel is full or closed, and refused entirely once the
    /// build has finished.
    pub fn append_log(&self, level: Level, message: impl Into<String>) {
        self.append(level, message.into(), false);
    }

    fn append(&self, level: Level, message: String, from_finisher: bool) {
        let tx = {
            let inner = self.inner.read();
            if !from_finisher && inner.finished {
                return;
            }
            inner.log_tx.clone()
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(LogEntry::now(level, message));
        }
    }

    /// Links the executor's opaque handle (task ARN, job name) to the
    /// synthetic task id, in both directions.
    pub fn record_task_handle(&self, task_id: &str, handle: &str) {
        let mut inner = self.inner.write();
        inner.handle_by_task.insert(task_id.to_string(), handle.to_string());
        inner.task_by_handle.insert(handle.to_string(), task_id.to_string());
    }

    pub fn task_for_handle(&self, handle: &str) -> Option<String> {
        self.inner.read().task_by_handle.get(handle).cloned()
    }

    pub fn mark_ingest_started(&self, task_id: &str) {
        self.inner.write().ingest_started.insert(task_id.to_string());
    }

    pub fn ingest_started(&self, task_id: &str) -> bool {
        self.inner.read().ingest_started.contains(task_id)
    }

    /// Marks the task's ingest stream as drained. Idempotent; returns true
    /// only when this call completed the last outstanding ingest.
    pub fn mark_ingest_done(&self, task_id: &str) -> bool {
        let mut inner = self.inner.write();
        if !inner.ingest_done.insert(task_id.to_string()) {
            return false;
        }
        inner.ingest_done_count += 1;
        inner.ingest_done_count == self.total_tasks
    }

    pub fn ingest_done(&self, task_id: &str) -> bool {
        self.inner.read().ingest_done.contains(task_id)
    }

    /// Records a worker result. The first accepted value for a task id
    /// wins: an identical retry is dropped, a conflicting digest is
    /// rejected. A failed result sets the sticky error.
    pub fn set_result(&self, task_id: &str, result: TaskResult) -> SetResultOutcome {
        let task_id = task_id.trim().to_string();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.results.get(&task_id) {
            if existing.image_digest == result.image_digest {
                return SetResultOutcome::DuplicateIgnored;
            }
            return SetResultOutcome::DigestConflict {
                existing_digest: existing.image_digest.clone(),
            };
        }

        if !result.success && inner.first_error.is_none() {
            inner.first_error = Some(format!("task {} failed: {}", task_id, result.error));
        }
        inner.results.insert(task_id, result);
        inner.results_received += 1;
        SetResultOutcome::Recorded
    }

    pub fn has_result(&self, task_id: &str) -> bool {
        self.inner.read().results.contains_key(task_id)
    }

    pub fn results(&self) -> HashMap<String, TaskResult> {
        self.inner.read().results.clone()
    }

    pub fn results_received(&self) -> usize {
        self.inner.read().results_received
    }

    pub fn all_results_received(&self) -> bool {
        self.inner.read().results_received == self.total_tasks
    }

    /// Waits until every expected result has arrived or the deadline
    /// passes; returns whether the set completed in time.
    pub async fn wait_results(&self, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if self.all_results_received() {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL.min(timeout - elapsed)).await;
        }
    }

    /// Records the first error; later calls are ignored.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.write();
        if inner.first_error.is_none() {
            inner.first_error = Some(message.into());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().first_error.clone()
    }

    pub fn has_error(&self) -> bool {
        self.inner.read().first_error.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.read().finished
    }

    /// Terminal transition: emits the task summary and the final verdict
    /// line, then closes the log channel and fires the done signal. Only
    /// the first call has any effect.
    pub fn finish(&self, error: Option<String>) {
        let effective = {
            let mut inner = self.inner.write();
            if inner.finished {
                return;
            }
            inner.finished = true;
            if inner.first_error.is_none() {
                inner.first_error = error;
            }
            inner.first_error.clone()
        };

        self.log_task_summary();

        match &effective {
            Some(err) => {
                self.append(Level::Error, format!("build finished with error: {err}"), true);
                self.append(Level::Error, "BUILD FAILED".to_string(), true);
            }
            None => {
                self.append(Level::Info, "build finished successfully".to_string(), true);
                self.append(Level::Info, "BUILD SUCCEEDED".to_string(), true);
            }
        }

        {
            let mut inner = self.inner.write();
            if !inner.closed {
                inner.log_tx = None;
                inner.closed = true;
            }
        }
        self.done.cancel();
    }

    /// One summary line per task id known to either the result map or the
    /// handle map, in sorted order.
    fn log_task_summary(&self) {
        let (results, handle_by_task) = {
            let inner = self.inner.read();
            (inner.results.clone(), inner.handle_by_task.clone())
        };

        let task_ids: BTreeSet<&String> = results.keys().chain(handle_by_task.keys()).collect();

        for task_id in task_ids {
            let (status, err) = match results.get(task_id) {
                Some(result) if result.success => ("success", "-".to_string()),
                Some(result) => {
                    let msg = result.error.trim();
                    ("failed", if msg.is_empty() { "-".to_string() } else { msg.to_string() })
                }
                None => ("unknown", "result missing".to_string()),
            };
            let handle = handle_by_task.get(task_id).map(String::as_str).unwrap_or_default();
            self.append(
                Level::Info,
                format!("[task-summary] task={task_id} handle={handle} status={status} err={err}"),
                true,
            );
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
