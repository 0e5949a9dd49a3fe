//! Task runner: the execution engine for the change/task graph.
//!
//! Each tick scans the graph under the state lock, dispatches ready tasks to
//! bounded worker tasks, applies retry backoff, and drives the abort/undo
//! cascade when a task fails. Handlers run outside the lock; workers
//! re-acquire it only to record results. Two ticks over an unchanged graph
//! are no-ops.


use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::handler::{HandlerContext, HandlerOutcome, HandlerRegistry, StopSignal, TaskHandler};
use crate::state::{ChangeId, StateError, StateHandle, TaskId, TaskStatus};

const fn default_max_workers() -> usize {
    16
}

const fn default_max_retries() -> u32 {
    5
}

/// Runner limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of concurrently executing tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Delayed retries allowed per task before it is converted to `Error`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Optional per-kind concurrency caps, to keep contended resources
    /// (e.g. the service manager) from being hammered.
    #[serde(default)]
    pub kind_limits: BTreeMap<String, usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            kind_limits: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    Run,
    Undo,
}

struct Dispatch {
    task_id: TaskId,
    change_id: ChangeId,
    handler: Arc<dyn TaskHandler>,
    mode: DispatchMode,
}

/// A spawned worker plus the IDs needed to record its fate if it panics.
struct Worker {
    task_id: TaskId,
    change_id: ChangeId,
    handle: JoinHandle<()>,
}

/// Executes ready tasks, applies retries, and performs undo cascades.
pub struct TaskRunner {
    state: Arc<StateHandle>,
    registry: Arc<HandlerRegistry>,
    config: RunnerConfig,
    stop_tx: watch::Sender<bool>,
    stop: StopSignal,
    workers: Mutex<Vec<Worker>>,
}

impl TaskRunner {
    /// Creates a runner over the given state and handler registry.
    #[must_use]
    pub fn new(state: Arc<StateHandle>, registry: Arc<HandlerRegistry>, config: RunnerConfig) -> Self {
        let (stop_tx, stop) = StopSignal::channel();
        Self {
            state,
            registry,
            config,
            stop_tx,
            stop,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The cancellation signal handed to workers.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs one execution tick: wakes elapsed `Wait` tasks, dispatches ready
    /// `Do` and `Undo` tasks up to the concurrency caps, and stamps
    /// `ready_time` on changes that completed.
    ///
    /// Not reentrant; the caller serializes invocations.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph references vanish mid-scan, which
    /// indicates a corrupted document.
    pub async fn ensure(&self) -> Result<(), StateError> {
        if self.stop.is_stopping() {
            return Ok(());
        }
        self.reap_finished().await;

        let now = Utc::now();
        let dispatches = self.scan(now)?;
        for dispatch in dispatches {
            self.spawn_worker(dispatch);
        }
        Ok(())
    }

    /// Signals cancellation, stops dispatching, and waits for every
    /// in-flight worker to reach its safe stopping point.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let drained: Vec<Worker> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain(..).collect()
        };
        for worker in drained {
            self.join_worker(worker).await;
        }
    }

    /// Whether any worker is still running.
    #[must_use]
    pub fn has_active_workers(&self) -> bool {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .any(|worker| !worker.handle.is_finished())
    }

    /// Joins finished workers so a panicking handler is recorded on its
    /// task instead of leaving it `Doing` forever.
    async fn reap_finished(&self) {
        let finished: Vec<Worker> = {
            let mut workers = self.workers.lock().unwrap();
            let mut finished = Vec::new();
            let mut running = Vec::new();
            for worker in workers.drain(..) {
                if worker.handle.is_finished() {
                    finished.push(worker);
                } else {
                    running.push(worker);
                }
            }
            *workers = running;
            finished
        };
        for worker in finished {
            self.join_worker(worker).await;
        }
    }

    async fn join_worker(&self, worker: Worker) {
        if let Err(err) = worker.handle.await {
            if err.is_panic() {
                self.record_panic(worker.task_id, worker.change_id);
            }
        }
    }

    /// A panicked worker never reached the recording path, so its task is
    /// still in flight; fail it and its change here.
    fn record_panic(&self, task_id: TaskId, change_id: ChangeId) {
        let now = Utc::now();
        let mut st = self.state.lock();
        let in_flight = st.task(task_id).map(|t| t.status.is_in_flight());
        let recorded = match in_flight {
            Ok(true) => mark_error(&mut st, task_id, "handler panicked".to_string())
                .and_then(|()| fail_change(&mut st, change_id, task_id))
                .and_then(|()| st.update_change_ready(change_id, now)),
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = recorded {
            warn!(task = %task_id, %err, "cannot record worker panic");
        }
    }

    /// Scans the graph and transitions selected tasks to `Doing`/`Undoing`
    /// under the lock, returning the work to spawn after the lock is
    /// released.
    fn scan(&self, now: DateTime<Utc>) -> Result<Vec<Dispatch>, StateError> {
        let mut state = self.state.lock();

        // Wake delayed retries whose resume time elapsed.
        let awake: Vec<TaskId> = state
            .tasks()
            .filter(|t| t.status == TaskStatus::Wait && t.resume_at.is_some_and(|at| at <= now))
            .map(|t| t.id)
            .collect();
        for task_id in awake {
            let task = state.task_mut(task_id)?;
            task.status = TaskStatus::Do;
            task.resume_at = None;
        }

        let mut in_flight = state
            .tasks()
            .filter(|t| t.status.is_in_flight())
            .count();
        let mut kind_active: BTreeMap<String, usize> = BTreeMap::new();
        for task in state.tasks().filter(|t| t.status.is_in_flight()) {
            *kind_active.entry(task.kind.clone()).or_default() += 1;
        }

        let mut selected: Vec<(TaskId, ChangeId, String, DispatchMode)> = Vec::new();

        // Forward pass: a Do task is ready when every prerequisite is Done.
        let ready: Vec<(TaskId, ChangeId, String)> = state
            .tasks()
            .filter(|t| t.status == TaskStatus::Do)
            .filter(|t| {
                t.wait_tasks.iter().all(|dep| {
                    state
                        .task(*dep)
                        .is_ok_and(|dep| dep.status == TaskStatus::Done)
                })
            })
            .map(|t| (t.id, t.change_id, t.kind.clone()))
            .collect();
        for (task_id, change_id, kind) in ready {
            if in_flight >= self.config.max_workers {
                break;
            }
            if self.kind_saturated(&kind, &kind_active) {
                continue;
            }
            selected.push((task_id, change_id, kind.clone(), DispatchMode::Run));
            in_flight += 1;
            *kind_active.entry(kind).or_default() += 1;
        }

        // Rollback pass: per (change, lane), undo strictly in reverse
        // completion order, one task at a time.
        let undo_ready = {
            let mut per_lane: BTreeMap<(ChangeId, u64), (TaskId, u64, String)> = BTreeMap::new();
            let mut blocked: Vec<(ChangeId, u64)> = Vec::new();
            for task in state.tasks() {
                let lane_key = (task.change_id, task.lane);
                if task.status.is_in_flight() {
                    blocked.push(lane_key);
                    continue;
                }
                if task.status != TaskStatus::Undo {
                    continue;
                }
                let rank = task.completion_rank.unwrap_or(0);
                let candidate = (task.id, rank, task.kind.clone());
                per_lane
                    .entry(lane_key)
                    .and_modify(|current| {
                        if rank > current.1 {
                            *current = candidate.clone();
                        }
                    })
                    .or_insert(candidate);
            }
            for lane_key in blocked {
                per_lane.remove(&lane_key);
            }
            per_lane
        };
        for ((change_id, _lane), (task_id, _rank, kind)) in undo_ready {
            if in_flight >= self.config.max_workers {
                break;
            }
            selected.push((task_id, change_id, kind, DispatchMode::Undo));
            in_flight += 1;
        }

        let mut dispatches = Vec::with_capacity(selected.len());
        for (task_id, change_id, kind, mode) in selected {
            // Missing handlers are caught at startup; a task enqueued with an
            // unregistered kind afterwards is failed rather than wedged.
            let Some(handler) = self.registry.get(&kind) else {
                warn!(task = %task_id, kind, "no handler registered, failing task");
                mark_error(
                    &mut state,
                    task_id,
                    format!("no handler registered for task kind '{kind}'"),
                )?;
                fail_change(&mut state, change_id, task_id)?;
                state.update_change_ready(change_id, now)?;
                continue;
            };
            let task = state.task_mut(task_id)?;
            task.status = match mode {
                DispatchMode::Run => TaskStatus::Doing,
                DispatchMode::Undo => TaskStatus::Undoing,
            };
            debug!(task = %task_id, change = %change_id, kind, ?mode, "dispatching task");
            dispatches.push(Dispatch {
                task_id,
                change_id,
                handler,
                mode,
            });
        }
        Ok(dispatches)
    }

    fn kind_saturated(&self, kind: &str, active: &BTreeMap<String, usize>) -> bool {
        self.config
            .kind_limits
            .get(kind)
            .is_some_and(|limit| active.get(kind).copied().unwrap_or(0) >= *limit)
    }

    fn spawn_worker(&self, dispatch: Dispatch) {
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        let max_retries = self.config.max_retries;
        let task_id = dispatch.task_id;
        let change_id = dispatch.change_id;
        let handle = tokio::spawn(async move {
            match dispatch.mode {
                DispatchMode::Run => {
                    run_task(
                        state,
                        dispatch.handler,
                        dispatch.task_id,
                        dispatch.change_id,
                        stop,
                        max_retries,
                    )
                    .await;
                },
                DispatchMode::Undo => {
                    undo_task(
                        state,
                        dispatch.handler,
                        dispatch.task_id,
                        dispatch.change_id,
                        stop,
                    )
                    .await;
                },
            }
        });
        self.workers.lock().unwrap().push(Worker {
            task_id,
            change_id,
            handle,
        });
    }
}

/// Executes a task's `run` handler and records the outcome.
async fn run_task(
    state: Arc<StateHandle>,
    handler: Arc<dyn TaskHandler>,
    task_id: TaskId,
    change_id: ChangeId,
    stop: StopSignal,
    max_retries: u32,
) {
    let ctx = HandlerContext::new(task_id, change_id, Arc::clone(&state), stop);
    let result = handler.run(&ctx).await;

    let now = Utc::now();
    let mut st = state.lock();
    let recorded = match result {
        Ok(HandlerOutcome::Done) => {
            let rank = st.next_completion_rank();
            st.task_mut(task_id).map(|task| {
                task.status = TaskStatus::Done;
                task.completion_rank = Some(rank);
            })
            // A task finishing into a change that failed meanwhile joins the
            // rollback of its lane instead of staying Done.
            .and_then(|()| extend_rollback(&mut st, change_id, task_id))
        },
        Ok(HandlerOutcome::Retry { after, reason }) => {
            let exhausted = st.task(task_id).map(|t| t.retries >= max_retries);
            match exhausted {
                Ok(true) => mark_error(
                    &mut st,
                    task_id,
                    format!("giving up after {max_retries} retries: {reason}"),
                )
                .and_then(|()| fail_change(&mut st, change_id, task_id)),
                Ok(false) => st.task_mut(task_id).map(|task| {
                    task.retries += 1;
                    task.status = TaskStatus::Wait;
                    // Oversized delays clamp to the far future instead of
                    // overflowing the timestamp arithmetic.
                    task.resume_at = Some(
                        chrono::Duration::from_std(after)
                            .ok()
                            .and_then(|delta| now.checked_add_signed(delta))
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    );
                    task.log_info(format!("will retry: {reason}"));
                }),
                Err(err) => Err(err),
            }
        },
        Err(err) => mark_error(&mut st, task_id, err.to_string())
            .and_then(|()| fail_change(&mut st, change_id, task_id)),
    };
    if let Err(err) = recorded.and_then(|()| st.update_change_ready(change_id, now)) {
        warn!(task = %task_id, %err, "cannot record task result");
    }
}

/// Executes a task's `undo` handler and records the outcome. An undo
/// failure is recorded but never cascades further.
async fn undo_task(
    state: Arc<StateHandle>,
    handler: Arc<dyn TaskHandler>,
    task_id: TaskId,
    change_id: ChangeId,
    stop: StopSignal,
) {
    let ctx = HandlerContext::new(task_id, change_id, Arc::clone(&state), stop);
    let result = handler.undo(&ctx).await;

    let now = Utc::now();
    let mut st = state.lock();
    let recorded = match result {
        Ok(()) => st.task_mut(task_id).map(|task| {
            task.status = TaskStatus::Undone;
        }),
        Err(err) => mark_error(&mut st, task_id, format!("undo failed: {err}")),
    };
    if let Err(err) = recorded.and_then(|()| st.update_change_ready(change_id, now)) {
        warn!(task = %task_id, %err, "cannot record undo result");
    }
}

fn mark_error(
    state: &mut crate::state::State,
    task_id: TaskId,
    message: String,
) -> Result<(), StateError> {
    warn!(task = %task_id, message, "task failed");
    let task = state.task_mut(task_id)?;
    task.status = TaskStatus::Error;
    task.log_error(message);
    Ok(())
}

/// Change-level failure: abort everything in the change that has not
/// started, and schedule rollback of the failed task's lane in reverse
/// completion order.
fn fail_change(
    state: &mut crate::state::State,
    change_id: ChangeId,
    failed_task_id: TaskId,
) -> Result<(), StateError> {
    let failed_lane = state.task(failed_task_id)?.lane;

    let to_abort: Vec<TaskId> = state
        .change_tasks(change_id)
        .filter(|t| {
            matches!(
                t.status,
                TaskStatus::Do | TaskStatus::Hold | TaskStatus::Wait
            )
        })
        .map(|t| t.id)
        .collect();
    for task_id in to_abort {
        state.task_mut(task_id)?.status = TaskStatus::Abort;
    }

    let to_undo: Vec<TaskId> = state
        .change_tasks(change_id)
        .filter(|t| t.status == TaskStatus::Done && t.lane == failed_lane)
        .map(|t| t.id)
        .collect();
    for task_id in to_undo {
        state.task_mut(task_id)?.status = TaskStatus::Undo;
    }
    Ok(())
}

/// If the change already carries an error in this task's lane, a freshly
/// completed task joins the rollback instead of staying `Done`.
fn extend_rollback(
    state: &mut crate::state::State,
    change_id: ChangeId,
    task_id: TaskId,
) -> Result<(), StateError> {
    let lane = state.task(task_id)?.lane;
    let lane_failed = state
        .change_tasks(change_id)
        .any(|t| t.status == TaskStatus::Error && t.lane == lane);
    if lane_failed {
        state.task_mut(task_id)?.status = TaskStatus::Undo;
    }
    Ok(())
}
