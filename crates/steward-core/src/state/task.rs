//! Task data model.
//!
//! A task is the atomic, retryable, undoable unit of work within a change.
//! Tasks carry a kind (the dispatch key into the handler registry), a status
//! driven by the runner's state machine, prerequisite edges to other tasks,
//! and an append-only progress log.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::ChangeId;
use super::StateError;

/// Stable identifier for a task, unique within one state document.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a task.
///
/// Forward path: `Do -> Doing -> Done`. A handler may request a delayed
/// retry (`Wait`), and a task that has not started when its change fails is
/// moved to `Abort`. Rollback path: `Undo -> Undoing -> Undone`. `Error` is
/// terminal in both directions. `Hold` parks a task until a manager
/// explicitly releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Ready to be dispatched once prerequisites are done.
    Do,
    /// A worker is currently executing the handler's do logic.
    Doing,
    /// The handler completed successfully.
    Done,
    /// The task never ran because its change failed first.
    Abort,
    /// Scheduled for rollback.
    Undo,
    /// A worker is currently executing the handler's undo logic.
    Undoing,
    /// Rollback completed successfully.
    Undone,
    /// The handler (do or undo) failed permanently.
    Error,
    /// A delayed retry was requested; redispatched after `resume_at`.
    Wait,
    /// Parked by a manager; never dispatched until released.
    Hold,
}

impl TaskStatus {
    /// Whether the task has reached a state the runner will never leave on
    /// its own.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Abort | Self::Undone | Self::Error)
    }

    /// Whether a worker is executing this task right now.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Doing | Self::Undoing)
    }

    /// Whether the task still has work ahead of it (forward or rollback).
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Do | Self::Doing | Self::Wait | Self::Hold | Self::Undo | Self::Undoing
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Do => "do",
            Self::Doing => "doing",
            Self::Done => "done",
            Self::Abort => "abort",
            Self::Undo => "undo",
            Self::Undoing => "undoing",
            Self::Undone => "undone",
            Self::Error => "error",
            Self::Wait => "wait",
            Self::Hold => "hold",
        };
        f.write_str(name)
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    /// Progress information.
    Info,
    /// A recorded failure.
    Error,
}

/// One append-only log entry on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was recorded.
    pub time: DateTime<Utc>,

    /// Entry severity.
    pub kind: LogKind,

    /// Human-readable message.
    pub message: String,
}

/// An atomic work item owned by a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,

    /// Dispatch key into the handler registry.
    pub kind: String,

    /// Human-readable summary.
    pub summary: String,

    /// The change this task belongs to.
    pub change_id: ChangeId,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Prerequisite tasks; this task is not dispatched until every one of
    /// them is `Done`.
    #[serde(default)]
    pub wait_tasks: Vec<TaskId>,

    /// Rollback grouping: tasks sharing a lane are undone together, in
    /// reverse completion order, when one of them fails.
    #[serde(default)]
    pub lane: u64,

    /// Number of delayed retries performed so far.
    #[serde(default)]
    pub retries: u32,

    /// Earliest time a `Wait` task may be redispatched.
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,

    /// Position in the global completion order, assigned when the task
    /// reaches `Done`. Drives reverse-order rollback.
    #[serde(default)]
    pub completion_rank: Option<u64>,

    /// Free-form payload read and written by the task's handler.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,

    /// Append-only progress and error log.
    #[serde(default)]
    pub log: Vec<LogEntry>,

    /// When the task was created.
    pub spawn_time: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(id: TaskId, change_id: ChangeId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            change_id,
            status: TaskStatus::Do,
            wait_tasks: Vec::new(),
            lane: 0,
            retries: 0,
            resume_at: None,
            completion_rank: None,
            data: BTreeMap::new(),
            log: Vec::new(),
            spawn_time: Utc::now(),
        }
    }

    /// Adds a prerequisite edge; duplicates are ignored.
    pub fn wait_for(&mut self, id: TaskId) {
        if !self.wait_tasks.contains(&id) {
            self.wait_tasks.push(id);
        }
    }

    /// Appends an informational log entry.
    pub fn log_info(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            time: Utc::now(),
            kind: LogKind::Info,
            message: message.into(),
        });
    }

    /// Appends an error log entry.
    pub fn log_error(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            time: Utc::now(),
            kind: LogKind::Error,
            message: message.into(),
        });
    }

    /// Stores a typed value in the task's payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn set_data<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(value).map_err(|source| StateError::Data {
            key: key.to_string(),
            source,
        })?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    /// Reads a typed value from the task's payload.
    ///
    /// Returns `None` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value cannot be decoded as `T`.
    pub fn get_data<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StateError> {
        match self.data.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| StateError::Data {
                    key: key.to_string(),
                    source,
                }),
        }
    }
}
