//! Task handlers and their registry.
//!
//! A handler is the executable logic bound to a task kind: a `run` ("do")
//! side that performs the work and an `undo` side that reverses it during
//! rollback. Handlers execute outside the state lock and may block on
//! external operations; they re-acquire the lock only for short critical
//! sections through the context.
//!
//! The registry is populated during single-threaded startup and treated as
//! immutable afterwards; duplicate registration is a programming bug and
//! panics so it is discovered the first time the process starts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::state::{ChangeId, StateHandle, TaskId};

/// Errors returned by task handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler failed; the message is logged onto the task.
    #[error("{0}")]
    Failed(String),

    /// The handler could not read or write its own task state.
    #[error("state error: {0}")]
    State(#[from] crate::state::StateError),
}

impl HandlerError {
    /// Convenience constructor for a plain failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Successful outcome of a handler's `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The task completed.
    Done,

    /// The task cannot make progress yet; redispatch after `after`.
    Retry {
        /// Requested delay before the next attempt.
        after: Duration,
        /// Reason, logged onto the task.
        reason: String,
    },
}

/// Cooperative cancellation signal handed to every handler invocation.
///
/// Handlers poll [`is_stopping`](Self::is_stopping) between steps of
/// blocking work, or select on [`stopped`](Self::stopped).
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Builds the sender half plus the signal handed to handlers.
    #[must_use]
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop is requested (or the runner went away).
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Execution context for one handler invocation.
///
/// Carries the IDs of the task and owning change plus access to the state
/// lock; the handler re-fetches its task through the lock rather than
/// holding a reference across the invocation.
pub struct HandlerContext {
    task_id: TaskId,
    change_id: ChangeId,
    state: Arc<StateHandle>,
    stop: StopSignal,
}

impl HandlerContext {
    pub(crate) fn new(
        task_id: TaskId,
        change_id: ChangeId,
        state: Arc<StateHandle>,
        stop: StopSignal,
    ) -> Self {
        Self {
            task_id,
            change_id,
            state,
            stop,
        }
    }

    /// ID of the task being executed.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// ID of the owning change.
    #[must_use]
    pub const fn change_id(&self) -> ChangeId {
        self.change_id
    }

    /// The shared state lock.
    #[must_use]
    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// The cancellation signal for this invocation.
    #[must_use]
    pub const fn stop(&self) -> &StopSignal {
        &self.stop
    }

    /// Reads a typed value from the task's payload under the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the task vanished or the value cannot be
    /// decoded.
    pub fn task_data<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, HandlerError> {
        let state = self.state.lock();
        Ok(state.task(self.task_id)?.get_data(key)?)
    }
}

/// The do/undo pair bound to a task kind.
///
/// `undo` defaults to a successful no-op; only kinds whose effects are
/// unobservable or idempotent to skip may rely on the default.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Performs the task's work.
    ///
    /// # Errors
    ///
    /// Returns an error to mark the task `Error` and trigger the change's
    /// abort/undo cascade.
    async fn run(&self, ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError>;

    /// Reverses the task's work during rollback.
    ///
    /// # Errors
    ///
    /// Returns an error to mark the task `Error`; the rollback walk
    /// continues regardless.
    async fn undo(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let _ = ctx;
        Ok(())
    }
}

/// Mapping from task kind to handler, frozen after startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `kind`.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is already registered. Duplicate registration is a
    /// manager configuration bug that must surface at startup, never be
    /// silently ignored.
    pub fn register(&mut self, kind: &str, handler: Arc<dyn TaskHandler>) {
        assert!(
            self.handlers.insert(kind.to_string(), handler).is_none(),
            "handler for task kind '{kind}' registered twice"
        );
    }

    /// Looks up the handler for `kind`.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Whether a handler exists for `kind`.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// All registered kinds, in sorted order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NopHandler;

    #[async_trait]
    impl TaskHandler for NopHandler {
        async fn run(&self, _ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Done)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("create-slice", Arc::new(NopHandler));

        assert!(registry.contains("create-slice"));
        assert!(registry.get("create-slice").is_some());
        assert!(!registry.contains("remove-slice"));
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["create-slice"]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register("create-slice", Arc::new(NopHandler));
        registry.register("create-slice", Arc::new(NopHandler));
    }

    #[tokio::test]
    async fn test_default_undo_is_noop() {
        let (_, stop) = StopSignal::channel();
        let state = Arc::new(StateHandle::new(crate::state::State::new()));
        let (change_id, task_id) = {
            let mut st = state.lock();
            let change_id = st.new_change("noop", "noop");
            let task_id = st.new_task(change_id, "noop", "noop").unwrap();
            (change_id, task_id)
        };

        let ctx = HandlerContext::new(task_id, change_id, state, stop);
        NopHandler.undo(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let (tx, stop) = StopSignal::channel();
        assert!(!stop.is_stopping());
        tx.send(true).unwrap();
        assert!(stop.is_stopping());
        stop.stopped().await;
    }
}
