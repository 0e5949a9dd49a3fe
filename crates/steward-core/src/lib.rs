//! steward-core - Task and change reconciliation engine.
//!
//! This library is the kernel of the steward daemon: a persistent,
//! crash-recoverable engine that turns declared intent (changes composed of
//! dependent tasks) into execution with retry, rollback, and durable
//! checkpointing. Domain subsystems plug in as managers that enqueue work
//! and register the handlers that execute it; the core stays ignorant of
//! what the tasks actually do.
//!
//! # Modules
//!
//! - [`state`]: The persisted change/task graph, manager sections, and the
//!   atomic checkpointer
//! - [`engine`]: The [`engine::Manager`] trait and the dispatcher that runs
//!   reconciliation passes over all managers in a fixed order
//! - [`handler`]: The [`handler::TaskHandler`] do/undo trait and its
//!   registry
//! - [`runner`]: Worker pool that dispatches ready tasks, applies retry
//!   backoff, and drives the abort/undo cascade
//! - [`overlord`]: Composition root tying state, engine, runner, and
//!   checkpointing together
//! - [`quota`]: Quota group manager, the built-in consumer of the core
//! - [`trust`]: Build-embedded root-of-trust documents plus injection
//! - [`config`]: TOML daemon configuration

pub mod config;
pub mod engine;
pub mod handler;
pub mod overlord;
pub mod quota;
pub mod runner;
pub mod state;
pub mod trust;

pub use config::StewardConfig;
pub use engine::{Manager, StateEngine};
pub use handler::{HandlerRegistry, TaskHandler};
pub use overlord::{Overlord, OverlordBuilder};
pub use runner::{RunnerConfig, TaskRunner};
pub use state::{ChangeId, ChangeStatus, State, StateHandle, TaskId, TaskStatus};
pub use trust::{TrustAnchor, TrustStore};
