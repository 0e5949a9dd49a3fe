//! Persisted reconciliation state.
//!
//! The state document is the single source of truth shared by every manager
//! and the task runner. It holds the change/task graph, per-manager sections,
//! and the monotonic counters that make checkpointing and reverse-order
//! rollback deterministic.
//!
//! # Locking discipline
//!
//! All access goes through [`StateHandle::lock`]. Components never hold a
//! `Task` or `Change` reference across a lock release; they keep IDs and
//! re-fetch, which is what makes checkpointing and crash recovery safe.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

pub mod change;
pub mod checkpoint;
pub mod task;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use change::{Change, ChangeId, ChangeStatus};
pub use task::{LogEntry, LogKind, Task, TaskId, TaskStatus};

/// Current on-disk schema version of the state document.
pub const STATE_VERSION: u32 = 1;

/// Errors raised by state access.
#[derive(Debug, Error)]
pub enum StateError {
    /// A change ID did not resolve.
    #[error("no change with id {0}")]
    ChangeNotFound(ChangeId),

    /// A task ID did not resolve.
    #[error("no task with id {0}")]
    TaskNotFound(TaskId),

    /// A manager section could not be decoded.
    #[error("cannot decode section '{section}': {source}")]
    Section {
        /// Section name.
        section: String,
        /// Decoding failure.
        source: serde_json::Error,
    },

    /// A task or change payload entry could not be encoded or decoded.
    #[error("cannot convert data entry '{key}': {source}")]
    Data {
        /// Payload key.
        key: String,
        /// Conversion failure.
        source: serde_json::Error,
    },
}

const fn default_version() -> u32 {
    STATE_VERSION
}

/// The root persisted object.
///
/// Changes and tasks live in a single arena addressed by stable IDs; all
/// cross-references are ID-based so the graph serializes without pointer
/// fixup and survives process restarts.
#[derive(Debug, Serialize, Deserialize)]
pub struct State {
    /// Schema version, for forward evolution of the document layout.
    #[serde(default = "default_version")]
    version: u32,

    /// Per-manager opaque sections, keyed by manager-chosen name. Unknown
    /// sections round-trip untouched.
    #[serde(default)]
    sections: BTreeMap<String, serde_json::Value>,

    /// Change arena in creation order (IDs are strictly increasing).
    #[serde(default)]
    changes: Vec<Change>,

    /// Task arena in creation order.
    #[serde(default)]
    tasks: Vec<Task>,

    /// Last allocated ID, shared by changes and tasks.
    #[serde(default)]
    last_id: u64,

    /// Last allocated completion rank.
    #[serde(default)]
    completion_seq: u64,

    /// Mutation counter. Not persisted: a freshly loaded document is clean.
    #[serde(skip)]
    dirty: u64,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Creates an empty state document.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            version: STATE_VERSION,
            sections: BTreeMap::new(),
            changes: Vec::new(),
            tasks: Vec::new(),
            last_id: 0,
            completion_seq: 0,
            dirty: 0,
        }
    }

    /// Current value of the mutation counter.
    #[must_use]
    pub const fn dirty(&self) -> u64 {
        self.dirty
    }

    /// Records a mutation. Called by every mutating accessor; callers that
    /// mutate through [`task_mut`](Self::task_mut) or
    /// [`change_mut`](Self::change_mut) get this for free.
    pub const fn mark_dirty(&mut self) {
        self.dirty += 1;
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Allocates the next completion rank.
    pub const fn next_completion_rank(&mut self) -> u64 {
        self.completion_seq += 1;
        self.completion_seq
    }

    /// Creates a new change and returns its ID.
    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        let id = ChangeId(self.next_id());
        self.changes.push(Change::new(id, kind, summary));
        self.mark_dirty();
        id
    }

    /// Creates a new task owned by `change_id` and appends it to the
    /// change's task list.
    ///
    /// # Errors
    ///
    /// Returns an error if the change does not exist.
    pub fn new_task(
        &mut self,
        change_id: ChangeId,
        kind: &str,
        summary: &str,
    ) -> Result<TaskId, StateError> {
        if !self.changes.iter().any(|c| c.id == change_id) {
            return Err(StateError::ChangeNotFound(change_id));
        }
        let id = TaskId(self.next_id());
        self.tasks.push(Task::new(id, change_id, kind, summary));
        self.change_mut(change_id)?.task_ids.push(id);
        Ok(id)
    }

    /// Fetches a change by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the change does not exist.
    pub fn change(&self, id: ChangeId) -> Result<&Change, StateError> {
        self.changes
            .iter()
            .find(|c| c.id == id)
            .ok_or(StateError::ChangeNotFound(id))
    }

    /// Fetches a change for mutation, bumping the dirty counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the change does not exist.
    pub fn change_mut(&mut self, id: ChangeId) -> Result<&mut Change, StateError> {
        self.dirty += 1;
        self.changes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StateError::ChangeNotFound(id))
    }

    /// Fetches a task by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the task does not exist.
    pub fn task(&self, id: TaskId) -> Result<&Task, StateError> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or(StateError::TaskNotFound(id))
    }

    /// Fetches a task for mutation, bumping the dirty counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the task does not exist.
    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StateError> {
        self.dirty += 1;
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StateError::TaskNotFound(id))
    }

    /// All changes in creation order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Tasks belonging to one change, in creation order.
    pub fn change_tasks(&self, change_id: ChangeId) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.change_id == change_id)
    }

    /// Reads a manager section, decoding it as `T`.
    ///
    /// An absent section is `None`; managers default it rather than treating
    /// absence as an error, which is what allows schema evolution.
    ///
    /// # Errors
    ///
    /// Returns an error if a present section cannot be decoded.
    pub fn get_section<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, StateError> {
        match self.sections.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(
                |source| StateError::Section {
                    section: name.to_string(),
                    source,
                },
            ),
        }
    }

    /// Writes a manager section.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn set_section<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), StateError> {
        let value = serde_json::to_value(value).map_err(|source| StateError::Section {
            section: name.to_string(),
            source,
        })?;
        self.sections.insert(name.to_string(), value);
        self.mark_dirty();
        Ok(())
    }

    /// Derives the status of a change from its tasks.
    ///
    /// See [`ChangeStatus`] for the aggregation rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the change does not exist.
    pub fn change_status(&self, id: ChangeId) -> Result<ChangeStatus, StateError> {
        let change = self.change(id)?;
        if change.task_ids.is_empty() {
            return Ok(ChangeStatus::Doing);
        }

        let mut all_done = true;
        let mut any_pending = false;
        for task in self.change_tasks(id) {
            if task.status == TaskStatus::Error {
                return Ok(ChangeStatus::Error);
            }
            if task.status.is_pending() {
                any_pending = true;
            }
            if task.status != TaskStatus::Done {
                all_done = false;
            }
        }
        if any_pending {
            Ok(ChangeStatus::Doing)
        } else if all_done {
            Ok(ChangeStatus::Done)
        } else {
            Ok(ChangeStatus::Undone)
        }
    }

    /// Whether every task of the change has reached a final status.
    ///
    /// # Errors
    ///
    /// Returns an error if the change does not exist.
    pub fn change_is_ready(&self, id: ChangeId) -> Result<bool, StateError> {
        let change = self.change(id)?;
        if change.task_ids.is_empty() {
            return Ok(false);
        }
        Ok(self.change_tasks(id).all(|t| t.status.is_final()))
    }

    /// Stamps `ready_time` on a change the first time all of its tasks are
    /// final. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the change does not exist.
    pub fn update_change_ready(
        &mut self,
        id: ChangeId,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        if self.change(id)?.ready_time.is_none() && self.change_is_ready(id)? {
            self.change_mut(id)?.ready_time = Some(now);
        }
        Ok(())
    }

    /// Drops completed changes (and their tasks) whose `ready_time` is older
    /// than the retention window. Incomplete changes are kept indefinitely
    /// for inspection. Returns the number of changes pruned.
    pub fn prune_changes(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let expired: BTreeSet<ChangeId> = self
            .changes
            .iter()
            .filter(|c| c.ready_time.is_some_and(|t| t < cutoff))
            .map(|c| c.id)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        self.tasks.retain(|t| !expired.contains(&t.change_id));
        self.changes.retain(|c| !expired.contains(&c.id));
        self.mark_dirty();
        expired.len()
    }

    /// Requeues work that was in flight when the process last exited:
    /// `Doing` becomes `Do` and `Undoing` becomes `Undo`. Called once after
    /// loading a checkpoint.
    pub fn normalize_after_load(&mut self) {
        for task in &mut self.tasks {
            match task.status {
                TaskStatus::Doing => task.status = TaskStatus::Do,
                TaskStatus::Undoing => task.status = TaskStatus::Undo,
                _ => {},
            }
        }
    }

    /// Verifies structural integrity of the change/task graph: every
    /// change->task and task->prerequisite edge must resolve, and every task
    /// must point back at an existing change that lists it.
    ///
    /// Returns a description of the first defect found.
    pub(crate) fn check_integrity(&self) -> Result<(), String> {
        let task_ids: BTreeSet<TaskId> = self.tasks.iter().map(|t| t.id).collect();
        let change_ids: BTreeSet<ChangeId> = self.changes.iter().map(|c| c.id).collect();

        for change in &self.changes {
            for task_id in &change.task_ids {
                if !task_ids.contains(task_id) {
                    return Err(format!(
                        "change {} references missing task {task_id}",
                        change.id
                    ));
                }
            }
        }
        for task in &self.tasks {
            if !change_ids.contains(&task.change_id) {
                return Err(format!(
                    "task {} references missing change {}",
                    task.id, task.change_id
                ));
            }
            for dep in &task.wait_tasks {
                if !task_ids.contains(dep) {
                    return Err(format!("task {} waits for missing task {dep}", task.id));
                }
            }
        }
        Ok(())
    }
}

/// The single reentrancy-free lock around the state document.
///
/// Rust's borrow rules replace the reentrant lock of the original design:
/// a caller holds one guard, performs its reads and writes through it, and
/// drops it before doing anything blocking.
#[derive(Debug)]
pub struct StateHandle {
    inner: Mutex<State>,
}

impl StateHandle {
    /// Wraps a state document in its lock.
    #[must_use]
    pub const fn new(state: State) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    /// Acquires the state lock.
    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap()
    }
}
