//! Overlord: owns the state, engine, runner, and checkpointing.
//!
//! The overlord is the composition root of the reconciliation core. The
//! embedding process builds one at startup, calls [`Overlord::ensure`] on
//! its chosen cadence, and calls [`Overlord::stop`] exactly once on
//! shutdown. Everything else (managers, handlers, trust) is wired through
//! the [`OverlordBuilder`] during single-threaded startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::engine::{EngineError, Manager, StateEngine};
use crate::handler::HandlerRegistry;
use crate::runner::{RunnerConfig, TaskRunner};
use crate::state::checkpoint::{CheckpointError, Checkpointer};
use crate::state::{StateError, StateHandle};
use crate::trust::TrustStore;

/// Default retention for completed changes before pruning.
pub const DEFAULT_PRUNE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors surfaced by the overlord.
#[derive(Debug, Error)]
pub enum OverlordError {
    /// A manager failed during a reconciliation pass or shutdown.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The state graph could not be read or written.
    #[error(transparent)]
    State(#[from] StateError),

    /// The durable document could not be loaded or written.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// A persisted task references a kind no registered manager handles.
    /// Starting anyway would wedge the change forever, so this is fatal.
    #[error("persisted task of kind '{kind}' has no registered handler")]
    MissingHandler {
        /// The orphaned task kind.
        kind: String,
    },
}

/// Assembles an [`Overlord`] during startup.
///
/// Managers register their task handlers against [`registry`](Self::registry)
/// and are then added with [`add_manager`](Self::add_manager); the order of
/// addition is the order of every `init`/`ensure` pass.
pub struct OverlordBuilder {
    state_dir: PathBuf,
    runner_config: RunnerConfig,
    prune_wait: Duration,
    trust: TrustStore,
    registry: HandlerRegistry,
    managers: Vec<Box<dyn Manager>>,
}

impl OverlordBuilder {
    /// Starts a builder rooted at `state_dir`.
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            runner_config: RunnerConfig::default(),
            prune_wait: DEFAULT_PRUNE_WAIT,
            trust: TrustStore::builtin(),
            registry: HandlerRegistry::new(),
            managers: Vec::new(),
        }
    }

    /// Overrides the runner limits.
    #[must_use]
    pub fn runner_config(mut self, config: RunnerConfig) -> Self {
        self.runner_config = config;
        self
    }

    /// Overrides the completed-change retention window.
    #[must_use]
    pub fn prune_wait(mut self, prune_wait: Duration) -> Self {
        self.prune_wait = prune_wait;
        self
    }

    /// Replaces the trust set handed to managers.
    #[must_use]
    pub fn trust(mut self, trust: TrustStore) -> Self {
        self.trust = trust;
        self
    }

    /// The handler registry managers register against.
    pub fn registry(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Adds a manager; it runs after all previously added ones.
    pub fn add_manager(&mut self, manager: Box<dyn Manager>) {
        self.managers.push(manager);
    }

    /// Loads the durable state and assembles the overlord.
    ///
    /// # Errors
    ///
    /// Returns an error if the state document cannot be loaded, or if a
    /// persisted unfinished task has no handler in the registry.
    pub fn build(self) -> Result<Overlord, OverlordError> {
        let mut checkpointer = Checkpointer::new(&self.state_dir);
        let state = checkpointer.load()?;

        // Refuse to start with work nothing can execute.
        for task in state.tasks().filter(|t| !t.status.is_final()) {
            if !self.registry.contains(&task.kind) {
                return Err(OverlordError::MissingHandler {
                    kind: task.kind.clone(),
                });
            }
        }

        let state = Arc::new(StateHandle::new(state));
        let mut engine = StateEngine::new(Arc::clone(&state));
        for manager in self.managers {
            engine.add_manager(manager);
        }
        let runner = TaskRunner::new(
            Arc::clone(&state),
            Arc::new(self.registry),
            self.runner_config,
        );

        info!(state_dir = %self.state_dir.display(), "overlord assembled");
        Ok(Overlord {
            state,
            engine,
            runner,
            checkpointer,
            trust: self.trust,
            prune_wait: self.prune_wait,
        })
    }
}

/// The assembled reconciliation core.
pub struct Overlord {
    state: Arc<StateHandle>,
    engine: StateEngine,
    runner: TaskRunner,
    checkpointer: Checkpointer,
    trust: TrustStore,
    prune_wait: Duration,
}

impl Overlord {
    /// The shared state lock.
    #[must_use]
    pub fn state(&self) -> &Arc<StateHandle> {
        &self.state
    }

    /// The trust set supplied at startup.
    #[must_use]
    pub const fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// The task runner, for callers that need its stop signal.
    #[must_use]
    pub const fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Runs one full reconciliation tick: manager passes, task dispatch,
    /// pruning of expired completed changes, then a checkpoint.
    ///
    /// The checkpoint runs even when an earlier phase failed, so whatever
    /// partial progress was recorded is durable; the first error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first manager, runner, or checkpoint failure.
    pub async fn ensure(&mut self) -> Result<(), OverlordError> {
        let tick: Result<(), OverlordError> = async {
            self.engine.ensure().await?;
            self.runner.ensure().await?;
            Ok(())
        }
        .await;

        let retention = chrono::Duration::from_std(self.prune_wait)
            .unwrap_or_else(|_| chrono::Duration::try_hours(24).unwrap_or(chrono::Duration::MAX));
        let pruned = self.state.lock().prune_changes(Utc::now(), retention);
        if pruned > 0 {
            debug!(pruned, "pruned expired changes");
        }

        let checkpointed = self.checkpointer.checkpoint(&self.state);
        tick?;
        checkpointed?;
        Ok(())
    }

    /// Shuts the core down: stops dispatch, waits for in-flight workers,
    /// stops every manager, and writes a final checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the first manager-stop or checkpoint failure; the full
    /// shutdown sequence runs regardless.
    pub async fn stop(&mut self) -> Result<(), OverlordError> {
        self.runner.stop().await;
        let stopped = self.engine.stop().await;
        let checkpointed = self.checkpointer.checkpoint(&self.state);
        stopped?;
        checkpointed?;
        info!("overlord stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::handler::{HandlerContext, HandlerError, HandlerOutcome, TaskHandler};
    use crate::state::{ChangeStatus, TaskStatus};

    struct NopHandler;

    #[async_trait]
    impl TaskHandler for NopHandler {
        async fn run(&self, _ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Done)
        }
    }

    fn builder_with_nop(dir: &Path) -> OverlordBuilder {
        let mut builder = OverlordBuilder::new(dir);
        builder.registry().register("nop", Arc::new(NopHandler));
        builder
    }

    #[tokio::test]
    async fn test_change_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let change_id = {
            let mut overlord = builder_with_nop(dir.path()).build().unwrap();
            let change_id = {
                let mut st = overlord.state().lock();
                let change_id = st.new_change("demo", "Run one nop task");
                st.new_task(change_id, "nop", "Nop").unwrap();
                change_id
            };
            for _ in 0..100 {
                overlord.ensure().await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
                if overlord.state().lock().change_is_ready(change_id).unwrap() {
                    break;
                }
            }
            overlord.stop().await.unwrap();
            change_id
        };

        // A fresh overlord over the same directory sees the completed change.
        let overlord = builder_with_nop(dir.path()).build().unwrap();
        let st = overlord.state().lock();
        assert_eq!(st.change_status(change_id).unwrap(), ChangeStatus::Done);
        assert!(st
            .change_tasks(change_id)
            .all(|t| t.status == TaskStatus::Done));
    }

    #[tokio::test]
    async fn test_build_rejects_orphaned_task_kind() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut overlord = builder_with_nop(dir.path()).build().unwrap();
            let mut st = overlord.state().lock();
            let change_id = st.new_change("demo", "Orphan");
            st.new_task(change_id, "vanished-kind", "Orphan").unwrap();
            drop(st);
            overlord.stop().await.unwrap();
        }

        // "vanished-kind" was registered by a manager that no longer exists.
        let err = OverlordBuilder::new(dir.path()).build().map(|_| ()).unwrap_err();
        assert!(
            matches!(err, OverlordError::MissingHandler { kind } if kind == "vanished-kind")
        );
    }

    #[tokio::test]
    async fn test_ensure_prunes_expired_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut overlord = builder_with_nop(dir.path())
            .prune_wait(Duration::ZERO)
            .build()
            .unwrap();

        let change_id = {
            let mut st = overlord.state().lock();
            let change_id = st.new_change("demo", "Prune me");
            st.new_task(change_id, "nop", "Nop").unwrap();
            change_id
        };
        for _ in 0..100 {
            overlord.ensure().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
            if overlord.state().lock().change(change_id).is_err() {
                break;
            }
        }

        // With zero retention the completed change is gone.
        assert!(overlord.state().lock().change(change_id).is_err());
    }
}
