use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::handler::HandlerRegistry;
use crate::runner::{RunnerConfig, TaskRunner};
use crate::state::{ChangeId, ChangeStatus, State, StateHandle, TaskStatus};

/// Records every backend call in order; optionally refuses one operation.
struct RecordingControl {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingControl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        })
    }

    fn set_fail_on(&self, op: &str) {
        *self.fail_on.lock().unwrap() = Some(op.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: String) -> Result<(), ControlError> {
        let op = call.split(' ').next().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(call);
        if self.fail_on.lock().unwrap().as_deref() == Some(op.as_str()) {
            return Err(ControlError(format!("{op} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for RecordingControl {
    async fn create_slice(&self, group: &QuotaGroup) -> Result<(), ControlError> {
        self.record(format!("create-slice {}", group.name))
    }

    async fn start_slice(&self, name: &str) -> Result<(), ControlError> {
        self.record(format!("start-slice {name}"))
    }

    async fn stop_slice(&self, name: &str) -> Result<(), ControlError> {
        self.record(format!("stop-slice {name}"))
    }

    async fn remove_slice(&self, name: &str) -> Result<(), ControlError> {
        self.record(format!("remove-slice {name}"))
    }

    async fn update_slice(&self, group: &QuotaGroup) -> Result<(), ControlError> {
        self.record(format!("update-slice {} {}", group.name, group.memory_limit))
    }

    async fn restart_service(&self, snap: &str) -> Result<(), ControlError> {
        self.record(format!("restart-service {snap}"))
    }
}

fn setup(control: Arc<RecordingControl>) -> (Arc<StateHandle>, TaskRunner) {
    let state = Arc::new(StateHandle::new(State::new()));
    let mut registry = HandlerRegistry::new();
    let _manager = QuotaManager::new(&mut registry, control);
    let runner = TaskRunner::new(
        Arc::clone(&state),
        Arc::new(registry),
        RunnerConfig::default(),
    );
    (state, runner)
}

/// Ticks the runner until the change reaches a ready state.
async fn settle(runner: &TaskRunner, state: &StateHandle, change_id: ChangeId) {
    for _ in 0..500 {
        runner.ensure().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        if state.lock().change_is_ready(change_id).unwrap() {
            return;
        }
    }
    panic!("change {change_id} did not settle");
}

#[tokio::test]
async fn test_create_quota_runs_slice_pipeline() {
    let control = RecordingControl::new();
    let (state, runner) = setup(Arc::clone(&control));

    let change_id = create_quota(&state, "foo", SIZE_GIB, &["test-snap"]).unwrap();
    settle(&runner, &state, change_id).await;

    let st = state.lock();
    assert_eq!(st.change_status(change_id).unwrap(), ChangeStatus::Done);
    assert_eq!(
        control.calls(),
        vec![
            "create-slice foo",
            "start-slice foo",
            "restart-service test-snap",
        ]
    );

    let quotas = all_quotas(&st).unwrap();
    let group = &quotas["foo"];
    assert_eq!(group.memory_limit, SIZE_GIB);
    assert_eq!(group.snaps, vec!["test-snap"]);
}

#[tokio::test]
async fn test_create_quota_rolls_back_on_start_failure() {
    let control = RecordingControl::new();
    control.set_fail_on("start-slice");
    let (state, runner) = setup(Arc::clone(&control));

    let change_id = create_quota(&state, "foo", SIZE_GIB, &["test-snap"]).unwrap();
    settle(&runner, &state, change_id).await;

    let st = state.lock();
    assert_eq!(st.change_status(change_id).unwrap(), ChangeStatus::Error);
    // Rollback removed the slice created before the failure.
    assert_eq!(
        control.calls(),
        vec!["create-slice foo", "start-slice foo", "remove-slice foo"]
    );
    // No trace of the group is left behind.
    assert!(!all_quotas(&st).unwrap().contains_key("foo"));

    let statuses: Vec<TaskStatus> = st.change_tasks(change_id).map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Undone, TaskStatus::Error, TaskStatus::Abort]
    );
}

#[tokio::test]
async fn test_update_quota_is_a_single_task() {
    let control = RecordingControl::new();
    let (state, runner) = setup(Arc::clone(&control));

    let create_id = create_quota(&state, "foo", SIZE_GIB, &["test-snap"]).unwrap();
    settle(&runner, &state, create_id).await;
    control.clear();

    let change_id = update_quota(&state, "foo", 2 * SIZE_GIB).unwrap().unwrap();
    {
        let st = state.lock();
        assert_eq!(st.change_tasks(change_id).count(), 1);
    }
    settle(&runner, &state, change_id).await;

    let st = state.lock();
    assert_eq!(st.change_status(change_id).unwrap(), ChangeStatus::Done);
    // The slice is rewritten in place, never recreated or restarted.
    assert_eq!(
        control.calls(),
        vec![format!("update-slice foo {}", 2 * SIZE_GIB)]
    );
    assert_eq!(all_quotas(&st).unwrap()["foo"].memory_limit, 2 * SIZE_GIB);
}

#[tokio::test]
async fn test_update_quota_rejects_noop_and_decrease() {
    let control = RecordingControl::new();
    let (state, runner) = setup(Arc::clone(&control));

    let create_id = create_quota(&state, "foo", 2 * SIZE_GIB, &[]).unwrap();
    settle(&runner, &state, create_id).await;

    assert!(update_quota(&state, "foo", 2 * SIZE_GIB).unwrap().is_none());
    assert!(matches!(
        update_quota(&state, "foo", SIZE_GIB),
        Err(QuotaError::CannotDecrease(_))
    ));
    assert!(matches!(
        update_quota(&state, "foo", 0),
        Err(QuotaError::ZeroLimit(_))
    ));
    assert!(matches!(
        update_quota(&state, "missing", SIZE_GIB),
        Err(QuotaError::GroupNotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_quota_tears_down_in_order() {
    let control = RecordingControl::new();
    let (state, runner) = setup(Arc::clone(&control));

    let create_id = create_quota(&state, "foo", SIZE_GIB, &["test-snap"]).unwrap();
    settle(&runner, &state, create_id).await;
    control.clear();

    let change_id = remove_quota(&state, "foo").unwrap();
    settle(&runner, &state, change_id).await;

    let st = state.lock();
    assert_eq!(st.change_status(change_id).unwrap(), ChangeStatus::Done);
    assert_eq!(
        control.calls(),
        vec![
            "stop-slice foo",
            "remove-slice foo",
            "restart-service test-snap",
        ]
    );
    assert!(!all_quotas(&st).unwrap().contains_key("foo"));
}

#[tokio::test]
async fn test_ensure_snap_absent_is_idempotent() {
    let control = RecordingControl::new();
    let (state, runner) = setup(Arc::clone(&control));

    let create_id = create_quota(&state, "foo", SIZE_GIB, &["test-snap"]).unwrap();
    settle(&runner, &state, create_id).await;
    control.clear();

    let change_id = ensure_snap_absent(&state, "test-snap").unwrap().unwrap();
    // Membership is dropped synchronously; only the restart is queued.
    {
        let st = state.lock();
        assert!(all_quotas(&st).unwrap()["foo"].snaps.is_empty());
    }
    settle(&runner, &state, change_id).await;
    assert_eq!(control.calls(), vec!["restart-service test-snap"]);

    // Second call finds nothing to do.
    assert!(ensure_snap_absent(&state, "test-snap").unwrap().is_none());
    assert!(ensure_snap_absent(&state, "never-seen").unwrap().is_none());
}

#[tokio::test]
async fn test_create_quota_validation() {
    let control = RecordingControl::new();
    let (state, runner) = setup(Arc::clone(&control));

    assert!(matches!(
        create_quota(&state, "", SIZE_GIB, &[]),
        Err(QuotaError::InvalidName(_))
    ));
    assert!(matches!(
        create_quota(&state, "Foo", SIZE_GIB, &[]),
        Err(QuotaError::InvalidName(_))
    ));
    assert!(matches!(
        create_quota(&state, "foo-", SIZE_GIB, &[]),
        Err(QuotaError::InvalidName(_))
    ));
    assert!(matches!(
        create_quota(&state, "foo", 0, &[]),
        Err(QuotaError::ZeroLimit(_))
    ));

    let change_id = create_quota(&state, "foo", SIZE_GIB, &[]).unwrap();
    settle(&runner, &state, change_id).await;
    assert!(matches!(
        create_quota(&state, "foo", SIZE_GIB, &[]),
        Err(QuotaError::GroupExists(_))
    ));
}
