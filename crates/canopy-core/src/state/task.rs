//! Task state machine
//!
//! `Initialized` is set once the task has a sequence id, quotas and a droplet.
//! After that the task mirrors its runner workload: `Started`, then exactly one
//! of `Succeeded` or `Failed`. Cancellation sets `Canceled` together with a
//! `Failed` condition carrying reason `TaskCanceled`, and takes precedence over
//! everything else when the task is displayed.

use super::Transition;
use crate::conditions::{
    find_condition, is_condition_true, is_stale, set_condition, Condition, ConditionStatus,
    Conditioned,
};
use crate::crd::{
    CanopyApp, CanopyTask, NamedRef, TaskStatus, TaskWorkload, TASK_CANCELED, TASK_FAILED,
    TASK_INITIALIZED, TASK_STARTED, TASK_SUCCEEDED,
};
use chrono::{DateTime, Duration, Utc};

pub const REASON_TASK_CANCELED: &str = "TaskCanceled";
pub const CANCELED_FAILURE_REASON: &str = "task was cancelled";

/// Quotas applied when a task is initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDefaults {
    pub memory_mb: i64,
    pub disk_quota_mb: i64,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            memory_mb: 500,
            disk_quota_mb: 1024,
        }
    }
}

/// Objects a task refers to, as observed by the driver
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskObservation<'a> {
    pub app: Option<&'a CanopyApp>,
    pub workload: Option<&'a TaskWorkload>,
    /// Sequence id the driver allocated for a task being initialized
    pub sequence_id: Option<i64>,
    pub defaults: TaskDefaults,
}

/// Externally visible task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceling,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Canceling => "CANCELING",
        }
    }
}

/// Display state and, for failed tasks, the failure reason
pub fn task_state(task: &CanopyTask) -> (TaskState, Option<String>) {
    let conditions = task.conditions();
    if is_condition_true(conditions, TASK_CANCELED) {
        return (TaskState::Failed, Some(CANCELED_FAILURE_REASON.to_string()));
    }
    if is_condition_true(conditions, TASK_SUCCEEDED) {
        return (TaskState::Succeeded, None);
    }
    if let Some(failed) = find_condition(conditions, TASK_FAILED).filter(|c| c.is_true()) {
        let reason = if failed.reason == REASON_TASK_CANCELED {
            CANCELED_FAILURE_REASON.to_string()
        } else {
            failed.message.clone()
        };
        return (TaskState::Failed, Some(reason));
    }
    if task.spec.canceled {
        return (TaskState::Canceling, None);
    }
    if is_condition_true(conditions, TASK_STARTED) {
        return (TaskState::Running, None);
    }
    (TaskState::Pending, None)
}

pub fn is_initialized(task: &CanopyTask) -> bool {
    is_condition_true(task.conditions(), TASK_INITIALIZED)
}

/// The terminal condition of a finished task
fn completion(task: &CanopyTask) -> Option<&Condition> {
    [TASK_SUCCEEDED, TASK_FAILED]
        .into_iter()
        .filter_map(|t| task.condition(t))
        .find(|c| c.is_true())
}

pub fn is_completed(task: &CanopyTask) -> bool {
    completion(task).is_some()
}

/// When a completed task should be deleted
pub fn expires_at(task: &CanopyTask, ttl: Duration) -> Option<DateTime<Utc>> {
    let finished = completion(task)?;
    let at = DateTime::parse_from_rfc3339(&finished.last_transition_time).ok()?;
    Some(at.with_timezone(&Utc) + ttl)
}

pub fn next_task_status(
    task: &CanopyTask,
    observed: &TaskObservation<'_>,
    now: DateTime<Utc>,
) -> Transition<TaskStatus> {
    if is_stale(task) {
        return Transition::NoOp;
    }

    let generation = task.metadata.generation;
    let mut status = task.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    let condition = |r#type: &str, value: ConditionStatus, reason: &str, message: &str| {
        Condition::new(r#type, value, reason, message, generation, now)
    };

    if task.spec.canceled {
        if !is_condition_true(&status.conditions, TASK_CANCELED) {
            set_condition(
                &mut status.conditions,
                condition(TASK_CANCELED, ConditionStatus::True, REASON_TASK_CANCELED, ""),
            );
            if completion(task).is_none() {
                set_condition(
                    &mut status.conditions,
                    condition(TASK_FAILED, ConditionStatus::True, REASON_TASK_CANCELED, ""),
                );
            }
        }
        return Transition::changed(task.status.as_ref(), status);
    }

    if is_completed(task) {
        return Transition::NoOp;
    }

    if !is_initialized(task) {
        let Some(app) = observed.app else {
            set_condition(
                &mut status.conditions,
                condition(
                    TASK_INITIALIZED,
                    ConditionStatus::False,
                    "AppNotFound",
                    format!("app {} not found", task.spec.app_ref.name).as_str(),
                ),
            );
            return Transition::changed(task.status.as_ref(), status);
        };
        let Some(droplet) = app.current_droplet() else {
            set_condition(
                &mut status.conditions,
                condition(
                    TASK_INITIALIZED,
                    ConditionStatus::False,
                    "DropletNotFound",
                    format!("app {} has no current droplet", task.spec.app_ref.name).as_str(),
                ),
            );
            return Transition::changed(task.status.as_ref(), status);
        };
        let Some(sequence_id) = observed.sequence_id else {
            return Transition::NoOp;
        };

        status.sequence_id = sequence_id;
        status.memory_mb = observed.defaults.memory_mb;
        status.disk_quota_mb = observed.defaults.disk_quota_mb;
        status.droplet_ref = Some(NamedRef::new(droplet));
        set_condition(
            &mut status.conditions,
            condition(TASK_INITIALIZED, ConditionStatus::True, "TaskInitialized", ""),
        );
        return Transition::changed(task.status.as_ref(), status);
    }

    if let Some(workload) = observed.workload {
        if is_condition_true(workload.conditions(), TASK_STARTED) {
            set_condition(
                &mut status.conditions,
                condition(TASK_STARTED, ConditionStatus::True, "TaskStarted", ""),
            );
        }
        if let Some(done) = [TASK_SUCCEEDED, TASK_FAILED]
            .into_iter()
            .filter_map(|t| workload.condition(t))
            .find(|c| c.is_true())
        {
            set_condition(
                &mut status.conditions,
                condition(
                    done.r#type.as_str(),
                    ConditionStatus::True,
                    done.reason.as_str(),
                    done.message.as_str(),
                ),
            );
        }
    }

    Transition::changed(task.status.as_ref(), status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        CanopyAppSpec, CanopyTaskSpec, DesiredState, Lifecycle, TaskWorkloadSpec,
        TaskWorkloadStatus,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn task() -> CanopyTask {
        let mut task = CanopyTask::new(
            "task-1",
            CanopyTaskSpec {
                command: vec!["echo".to_string(), "hello".to_string()],
                app_ref: NamedRef::new("app-1"),
                canceled: false,
            },
        );
        task.metadata.generation = Some(1);
        task
    }

    fn app(droplet: Option<&str>) -> CanopyApp {
        CanopyApp::new(
            "app-1",
            CanopyAppSpec {
                display_name: "app".to_string(),
                desired_state: DesiredState::Started,
                current_droplet_ref: droplet.map(NamedRef::new),
                lifecycle: Lifecycle::default(),
                env_secret_name: None,
            },
        )
    }

    fn workload(conditions: &[(&str, &str)]) -> TaskWorkload {
        let mut workload = TaskWorkload::new(
            "task-1",
            TaskWorkloadSpec {
                image: "image".to_string(),
                image_pull_secrets: vec![],
                command: vec![],
                memory_mb: 500,
                disk_mb: 1024,
                env_secret_name: None,
            },
        );
        workload.status = Some(TaskWorkloadStatus {
            observed_generation: 1,
            conditions: conditions
                .iter()
                .map(|(t, msg)| Condition::new(t, ConditionStatus::True, "Runner", *msg, Some(1), now()))
                .collect(),
        });
        workload
    }

    fn apply(task: &mut CanopyTask, observed: &TaskObservation<'_>) {
        if let Transition::Update(status) = next_task_status(task, observed, now()) {
            task.status = Some(status);
        }
    }

    fn initialized() -> CanopyTask {
        let mut task = task();
        let app = app(Some("droplet-1"));
        apply(
            &mut task,
            &TaskObservation {
                app: Some(&app),
                sequence_id: Some(6),
                ..Default::default()
            },
        );
        task
    }

    #[test]
    fn test_initialization_applies_defaults() {
        let task = initialized();
        let status = task.status.clone().unwrap();
        assert!(is_initialized(&task));
        assert_eq!(status.sequence_id, 6);
        assert_eq!(status.memory_mb, 500);
        assert_eq!(status.disk_quota_mb, 1024);
        assert_eq!(status.droplet_ref, Some(NamedRef::new("droplet-1")));
        assert_eq!(task_state(&task), (TaskState::Pending, None));
    }

    #[test]
    fn test_missing_droplet_blocks_initialization() {
        let task = task();
        let app = app(None);
        let status = next_task_status(
            &task,
            &TaskObservation {
                app: Some(&app),
                sequence_id: Some(1),
                ..Default::default()
            },
            now(),
        )
        .into_update()
        .unwrap();

        let init = find_condition(&status.conditions, TASK_INITIALIZED).unwrap();
        assert_eq!(init.status, ConditionStatus::False);
        assert_eq!(init.reason, "DropletNotFound");
    }

    #[test]
    fn test_mirrors_runner_progress() {
        let mut task = initialized();
        let running = workload(&[(TASK_STARTED, "")]);
        apply(
            &mut task,
            &TaskObservation {
                workload: Some(&running),
                ..Default::default()
            },
        );
        assert_eq!(task_state(&task).0, TaskState::Running);

        let failed = workload(&[(TASK_STARTED, ""), (TASK_FAILED, "exit status 1")]);
        apply(
            &mut task,
            &TaskObservation {
                workload: Some(&failed),
                ..Default::default()
            },
        );
        assert_eq!(
            task_state(&task),
            (TaskState::Failed, Some("exit status 1".to_string()))
        );
        assert!(is_completed(&task));
    }

    #[test]
    fn test_canceling_until_acknowledged() {
        let mut task = initialized();
        task.spec.canceled = true;
        assert_eq!(task_state(&task).0, TaskState::Canceling);

        task.metadata.generation = Some(2);
        apply(&mut task, &TaskObservation::default());
        assert!(is_condition_true(task.conditions(), TASK_CANCELED));
        assert_eq!(task.condition(TASK_FAILED).unwrap().reason, REASON_TASK_CANCELED);
        assert_eq!(
            task_state(&task),
            (TaskState::Failed, Some(CANCELED_FAILURE_REASON.to_string()))
        );
    }

    #[test]
    fn test_cancellation_takes_precedence_over_success() {
        let mut task = initialized();
        let succeeded = workload(&[(TASK_STARTED, ""), (TASK_SUCCEEDED, "")]);
        apply(
            &mut task,
            &TaskObservation {
                workload: Some(&succeeded),
                ..Default::default()
            },
        );
        assert_eq!(task_state(&task).0, TaskState::Succeeded);

        let mut status = task.status.clone().unwrap();
        set_condition(
            &mut status.conditions,
            Condition::new(TASK_CANCELED, ConditionStatus::True, REASON_TASK_CANCELED, "", Some(1), now()),
        );
        task.status = Some(status);
        assert_eq!(
            task_state(&task),
            (TaskState::Failed, Some(CANCELED_FAILURE_REASON.to_string()))
        );
    }

    #[test]
    fn test_completed_task_is_frozen_and_expires() {
        let mut task = initialized();
        let succeeded = workload(&[(TASK_STARTED, ""), (TASK_SUCCEEDED, "")]);
        let observed = TaskObservation {
            workload: Some(&succeeded),
            ..Default::default()
        };
        apply(&mut task, &observed);
        assert!(next_task_status(&task, &observed, now()).is_noop());

        let expiry = expires_at(&task, Duration::days(30)).unwrap();
        assert_eq!(expiry, now() + Duration::days(30));
        assert_eq!(expires_at(&initialized(), Duration::days(30)), None);
    }

    #[test]
    fn test_idempotent() {
        let task = task();
        let app = app(Some("droplet-1"));
        let observed = TaskObservation {
            app: Some(&app),
            sequence_id: Some(3),
            ..Default::default()
        };
        assert_eq!(
            next_task_status(&task, &observed, now()),
            next_task_status(&task, &observed, now())
        );
    }

    #[test]
    fn test_stale_read_is_noop() {
        let mut task = initialized();
        task.metadata.generation = Some(0);
        assert!(next_task_status(&task, &TaskObservation::default(), now()).is_noop());
    }
}
