//! State engine: dispatches reconciliation passes to managers.
//!
//! The engine owns the ordered list of managers and is the process's single
//! entry point for "do a reconciliation pass". Most of the actual work is
//! done by the registered managers, which coordinate solely through the
//! shared state: they must cope with `ensure` calls in any order and
//! represent anything slow as tasks for the runner, never inline work.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::state::StateHandle;

/// Error type returned by manager implementations.
///
/// Managers surface their own error enums boxed; the engine only forwards
/// the first failure per phase.
pub type ManagerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the engine to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A manager's `init` failed; the engine is unusable until a later
    /// `ensure` retries initialization from scratch.
    #[error("manager '{manager}' failed to initialize: {source}")]
    Init {
        /// The failing manager.
        manager: &'static str,
        /// The manager's error.
        #[source]
        source: ManagerError,
    },

    /// A manager's `ensure` failed; later managers were skipped for this
    /// tick and the tick must be retried.
    #[error("manager '{manager}' failed to ensure: {source}")]
    Ensure {
        /// The failing manager.
        manager: &'static str,
        /// The manager's error.
        #[source]
        source: ManagerError,
    },

    /// A manager's `stop` failed; remaining managers were still stopped.
    #[error("manager '{manager}' failed to stop: {source}")]
    Stop {
        /// The failing manager.
        manager: &'static str,
        /// The manager's error.
        #[source]
        source: ManagerError,
    },
}

/// A subsystem that reconciles desired versus actual state.
///
/// Managers enqueue changes and tasks under the state lock and supply the
/// handlers that execute them; they never call each other directly.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Stable name, used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Hands the manager the state it is supposed to track. May be called
    /// again after a `stop`.
    async fn init(&mut self, state: Arc<StateHandle>) -> Result<(), ManagerError>;

    /// Forces a complete evaluation of the manager's desired state. Must be
    /// quick and atomic-on-failure: long work belongs in tasks.
    async fn ensure(&mut self) -> Result<(), ManagerError>;

    /// Asks the manager to wind down activities it started. Defaults to a
    /// no-op for managers whose work lives entirely in task handlers.
    async fn stop(&mut self) -> Result<(), ManagerError> {
        Ok(())
    }
}

/// Controls the dispatching of reconciliation passes to managers.
pub struct StateEngine {
    state: Arc<StateHandle>,
    managers: Vec<Box<dyn Manager>>,
    inited: bool,
}

impl StateEngine {
    /// Creates an engine over the shared state.
    #[must_use]
    pub fn new(state: Arc<StateHandle>) -> Self {
        Self {
            state,
            managers: Vec::new(),
            inited: false,
        }
    }

    /// The shared state.
    #[must_use]
    pub const fn state(&self) -> &Arc<StateHandle> {
        &self.state
    }

    /// Adds a manager. Managers run in registration order on every pass;
    /// registration happens during single-threaded startup only.
    pub fn add_manager(&mut self, manager: Box<dyn Manager>) {
        self.managers.push(manager);
    }

    /// Whether initialization has completed.
    #[must_use]
    pub const fn is_inited(&self) -> bool {
        self.inited
    }

    /// Runs one reconciliation pass.
    ///
    /// On the first call (or after a failed init, or after `stop`) every
    /// manager's `init` runs in registration order; the whole sequence is
    /// aborted on the first failure and retried from scratch next time.
    /// Once initialized, every manager's `ensure` runs in the same fixed
    /// order; the first failure is returned and later managers are skipped
    /// for this tick.
    ///
    /// Not reentrant; the caller serializes invocations.
    ///
    /// # Errors
    ///
    /// Returns the first `init` or `ensure` failure.
    pub async fn ensure(&mut self) -> Result<(), EngineError> {
        if !self.inited {
            for manager in &mut self.managers {
                let name = manager.name();
                debug!(manager = name, "initializing manager");
                manager
                    .init(Arc::clone(&self.state))
                    .await
                    .map_err(|source| EngineError::Init {
                        manager: name,
                        source,
                    })?;
            }
            self.inited = true;
            info!(managers = self.managers.len(), "state engine initialized");
        }

        for manager in &mut self.managers {
            let name = manager.name();
            manager.ensure().await.map_err(|source| EngineError::Ensure {
                manager: name,
                source,
            })?;
        }
        Ok(())
    }

    /// Stops every manager, best-effort: all managers are stopped even when
    /// an earlier one fails, and the first error is returned. Clears the
    /// initialized flag so a subsequent `ensure` re-runs `init`.
    ///
    /// # Errors
    ///
    /// Returns the first `stop` failure, after the full drain.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        if !self.inited {
            return Ok(());
        }
        let mut first_error = None;
        for manager in &mut self.managers {
            let name = manager.name();
            if let Err(source) = manager.stop().await {
                if first_error.is_none() {
                    first_error = Some(EngineError::Stop {
                        manager: name,
                        source,
                    });
                }
            }
        }
        self.inited = false;
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
