//! Change data model.
//!
//! A change is the user-visible unit of intent, composed of one or more
//! tasks. Its status is never stored: it is always derived from the statuses
//! of its tasks, so the two can never disagree after a crash.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;
use super::StateError;

/// Stable identifier for a change, unique within one state document.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ChangeId(pub u64);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derived status of a change, aggregated from its tasks.
///
/// Aggregation order is deterministic: any `Error` task makes the change
/// `Error`; otherwise any pending task makes it `Doing`; otherwise all-`Done`
/// makes it `Done`; anything else (a mix of `Undone` and `Abort`, possibly
/// alongside `Done` survivors of unaffected lanes) is `Undone`. A change with
/// no tasks yet is `Doing`: it represents intent that has not been spelled
/// out, not completed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeStatus {
    /// At least one task still has work ahead of it.
    Doing,
    /// Every task completed successfully.
    Done,
    /// At least one task failed permanently.
    Error,
    /// The change was rolled back or aborted before completing.
    Undone,
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Doing => "doing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Undone => "undone",
        };
        f.write_str(name)
    }
}

/// A named, persisted unit of intent composed of one or more tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Unique identifier.
    pub id: ChangeId,

    /// Intent tag, e.g. `create-quota`.
    pub kind: String,

    /// Human-readable summary.
    pub summary: String,

    /// Member tasks in creation order.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,

    /// Free-form payload owned by the enqueuing manager.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,

    /// When the change was created.
    pub spawn_time: DateTime<Utc>,

    /// When every task reached a final status. Unset while work is pending;
    /// drives retention-based pruning.
    #[serde(default)]
    pub ready_time: Option<DateTime<Utc>>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            task_ids: Vec::new(),
            data: BTreeMap::new(),
            spawn_time: Utc::now(),
            ready_time: None,
        }
    }

    /// Whether the change has reached a final status.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready_time.is_some()
    }

    /// Stores a typed value in the change's payload.
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

    /// Reads a typed value from the change's payload.
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
