//! CanopyTask Controller
//!
//! Initializes a task (sequence id, quotas, droplet), hands it to the task
//! runner through a `TaskWorkload`, mirrors the runner's progress and deletes
//! the task once its time-to-live after completion has passed.

use crate::config::ControllerConfig;
use crate::controller::{
    drive, namespace_of, object_key, validation_message, watch_api, ControllerContext,
    ControllerMetrics,
};
use crate::error::{OperatorError, Result};
use canopy_core::conditions::{set_condition, Condition, ConditionStatus};
use canopy_core::crd::{
    CanopyApp, CanopyBuild, CanopyTask, TaskWorkload, TaskWorkloadSpec, TASK_INITIALIZED,
};
use canopy_core::identity::Deadline;
use canopy_core::labels::{APP_GUID_LABEL, TASK_GUID_LABEL, TASK_SEQUENCE_ANNOTATION};
use canopy_core::retry::{retry_transient, RetryPolicy};
use canopy_core::state::task::{
    expires_at, is_completed, is_initialized, next_task_status, task_state, TaskObservation,
};
use canopy_core::state::Transition;
use canopy_core::store::{is_owned_by, set_owner, KubeStore, Store};
use canopy_core::Error;
use chrono::Utc;
use kube::api::ObjectMeta;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// How long a reconcile keeps retrying conflicting writes to a shared app
const CONFLICT_RETRY_WINDOW: Duration = Duration::from_secs(10);

const REASON_INVALID_SEQUENCE_ID: &str = "InvalidSequenceId";

/// Start the CanopyTask controller
pub async fn run_task_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    namespace: Option<String>,
) -> Result<()> {
    let ctx = Arc::new(
        ControllerContext::new(KubeStore::new(client.clone()), config)
            .with_metrics(ControllerMetrics::new("task")),
    );

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting CanopyTask controller"
    );

    let controller = Controller::new(
        watch_api::<CanopyTask>(&client, namespace.as_deref()),
        Config::default(),
    )
    .owns(
        watch_api::<TaskWorkload>(&client, namespace.as_deref()),
        Config::default(),
    );
    drive("task", controller, reconcile::<KubeStore>, error_policy::<KubeStore>, ctx).await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(task, ctx), fields(name = %task.name_any(), namespace = task.namespace()))]
pub async fn reconcile<S: Store>(task: Arc<CanopyTask>, ctx: Arc<ControllerContext<S>>) -> Result<Action> {
    let key = object_key(task.as_ref());
    ctx.track(&key, apply_task(task, &ctx)).await
}

pub fn error_policy<S: Store>(
    task: Arc<CanopyTask>,
    error: &OperatorError,
    ctx: Arc<ControllerContext<S>>,
) -> Action {
    ctx.backoff(&object_key(task.as_ref()), error)
}

async fn apply_task<S: Store>(task: Arc<CanopyTask>, ctx: &ControllerContext<S>) -> Result<Action> {
    let store = &ctx.store;
    let namespace = namespace_of(task.as_ref())?;
    let name = task.name_any();
    let mut task = task.as_ref().clone();

    if is_completed(&task) && !task.spec.canceled {
        return expire(ctx, &task, &namespace).await;
    }

    if let Err(errors) = task.spec.validate() {
        let message = validation_message(&errors);
        warn!(name = %name, errors = %message, "Task spec validation failed");
        fail_task(store, &task, &namespace, "InvalidSpec", &message).await?;
        return Ok(Action::await_change());
    }

    let app: Option<CanopyApp> = store.get_opt(&namespace, &task.spec.app_ref.name).await?;
    if let Some(app) = &app {
        if !is_owned_by(&task, app) {
            set_owner(app, &mut task)?;
            task = store.replace(&namespace, &task).await?;
        }
    }

    let sequence_id = match &app {
        Some(app) if !is_initialized(&task) && !task.spec.canceled && app.current_droplet().is_some() => {
            match allocate_sequence_id(ctx, app, &namespace).await {
                Ok(id) => Some(id),
                Err(OperatorError::Store(Error::InvalidState(message))) => {
                    warn!(name = %name, error = %message, "Cannot allocate task sequence id");
                    fail_task(store, &task, &namespace, REASON_INVALID_SEQUENCE_ID, &message).await?;
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(e),
            }
        }
        _ => None,
    };

    let workload = if task.spec.canceled {
        cancel_workload(store, &namespace, &name).await?;
        None
    } else if is_initialized(&task) {
        Some(ensure_workload(store, &task, app.as_ref(), &namespace).await?)
    } else {
        None
    };

    let observed = TaskObservation {
        app: app.as_ref(),
        workload: workload.as_ref(),
        sequence_id,
        defaults: ctx.config.task_defaults(),
    };
    if let Transition::Update(status) = next_task_status(&task, &observed, Utc::now()) {
        task.status = Some(status);
        task = store.replace_status(&namespace, &task).await?;
        let (state, _) = task_state(&task);
        debug!(name = %name, state = state.as_str(), "Updated task status");
    }

    // A freshly initialized task gets its workload on this pass rather than
    // waiting for the status write to come back through the watch
    if is_initialized(&task) && workload.is_none() && !task.spec.canceled {
        ensure_workload(store, &task, app.as_ref(), &namespace).await?;
    }

    if is_completed(&task) {
        return expire(ctx, &task, &namespace).await;
    }
    Ok(Action::await_change())
}

/// Take the next task sequence number of `app`.
///
/// The counter lives in an annotation on the app, so allocation is an
/// optimistic update retried on conflict.
async fn allocate_sequence_id<S: Store>(
    ctx: &ControllerContext<S>,
    app: &CanopyApp,
    namespace: &str,
) -> Result<i64> {
    let store = &ctx.store;
    let app_name = app.name_any();
    let policy = RetryPolicy::default();

    let id = retry_transient(
        Deadline::after(CONFLICT_RETRY_WINDOW),
        &policy,
        "allocate task sequence id",
        || async {
            let mut current: CanopyApp = store.get(namespace, &app_name).await?;
            let last = match current.annotations().get(TASK_SEQUENCE_ANNOTATION) {
                None => 0,
                Some(value) => value.parse::<i64>().map_err(|_| {
                    Error::InvalidState(format!(
                        "app {app_name} has a non-numeric {TASK_SEQUENCE_ANNOTATION} annotation {value:?}"
                    ))
                })?,
            };
            let next = last.checked_add(1).ok_or_else(|| {
                Error::InvalidState(format!("task sequence of app {app_name} is exhausted"))
            })?;
            current
                .annotations_mut()
                .insert(TASK_SEQUENCE_ANNOTATION.to_string(), next.to_string());
            store.replace(namespace, &current).await?;
            Ok(next)
        },
    )
    .await?;

    debug!(app = %app_name, sequence_id = id, "Allocated task sequence id");
    Ok(id)
}

/// Get the task's workload, creating it on first sight
async fn ensure_workload<S: Store>(
    store: &S,
    task: &CanopyTask,
    app: Option<&CanopyApp>,
    namespace: &str,
) -> Result<TaskWorkload> {
    let name = task.name_any();
    if let Some(existing) = store.get_opt::<TaskWorkload>(namespace, &name).await? {
        return Ok(existing);
    }

    let status = task.status.clone().unwrap_or_default();
    let droplet_name = status
        .droplet_ref
        .as_ref()
        .map(|r| r.name.clone())
        .unwrap_or_default();
    let build: CanopyBuild = store.get(namespace, &droplet_name).await?;
    let droplet = build.status.and_then(|s| s.droplet).ok_or_else(|| {
        Error::InvalidState(format!("build {droplet_name} has no droplet"))
    })?;

    let mut workload = TaskWorkload {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (APP_GUID_LABEL.to_string(), task.spec.app_ref.name.clone()),
                (TASK_GUID_LABEL.to_string(), name.clone()),
            ])),
            ..Default::default()
        },
        spec: TaskWorkloadSpec {
            image: droplet.registry.image,
            image_pull_secrets: droplet.registry.image_pull_secrets,
            command: task.spec.command.clone(),
            memory_mb: status.memory_mb,
            disk_mb: status.disk_quota_mb,
            env_secret_name: app.and_then(|a| a.spec.env_secret_name.clone()),
        },
        status: None,
    };
    set_owner(task, &mut workload)?;

    match store.create(namespace, &workload).await {
        Ok(created) => {
            info!(name = %name, "Created task workload");
            Ok(created)
        }
        Err(Error::AlreadyExists { .. }) => Ok(store.get(namespace, &name).await?),
        Err(e) => Err(e.into()),
    }
}

async fn cancel_workload<S: Store>(store: &S, namespace: &str, name: &str) -> Result<()> {
    match store.delete::<TaskWorkload>(namespace, name).await {
        Ok(()) => {
            info!(name = %name, "Deleted workload of canceled task");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete a completed task whose time-to-live has passed, otherwise requeue
/// for the moment it does
async fn expire<S: Store>(ctx: &ControllerContext<S>, task: &CanopyTask, namespace: &str) -> Result<Action> {
    let Some(at) = expires_at(task, ctx.config.task_ttl()) else {
        return Ok(Action::await_change());
    };
    let remaining = at - Utc::now();
    if remaining > chrono::Duration::zero() {
        let delay = remaining.to_std().unwrap_or(Duration::ZERO);
        return Ok(Action::requeue(delay));
    }

    match ctx.store.delete::<CanopyTask>(namespace, &task.name_any()).await {
        Ok(()) => info!(name = %task.name_any(), "Deleted expired task"),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    Ok(Action::await_change())
}

/// Mark the task as never initializable
async fn fail_task<S: Store>(
    store: &S,
    task: &CanopyTask,
    namespace: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let generation = task.metadata.generation;
    let mut status = task.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new(TASK_INITIALIZED, ConditionStatus::False, reason, message, generation, Utc::now()),
    );
    if task.status.as_ref() != Some(&status) {
        let mut updated = task.clone();
        updated.status = Some(status);
        store.replace_status(namespace, &updated).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::conditions::{condition_status, find_condition, Conditioned};
    use canopy_core::crd::{
        BuildStatus, CanopyAppSpec, CanopyBuildSpec, CanopyTaskSpec, DesiredState, DropletStatus,
        Lifecycle, NamedRef, Registry, TASK_CANCELED, TASK_FAILED,
        TASK_STARTED, TASK_SUCCEEDED,
    };
    use canopy_core::state::task::{TaskState, CANCELED_FAILURE_REASON, REASON_TASK_CANCELED};
    use canopy_core::store::MemoryStore;

    const NS: &str = "space-1";

    fn ctx_with(store: &MemoryStore, config: ControllerConfig) -> Arc<ControllerContext<MemoryStore>> {
        Arc::new(ControllerContext::new(store.clone(), Arc::new(config)))
    }

    fn ctx(store: &MemoryStore) -> Arc<ControllerContext<MemoryStore>> {
        ctx_with(store, ControllerConfig::default())
    }

    async fn seed(store: &MemoryStore, droplet: Option<&str>) {
        store
            .create(
                NS,
                &CanopyApp::new(
                    "app-1",
                    CanopyAppSpec {
                        display_name: "app".to_string(),
                        desired_state: DesiredState::Started,
                        current_droplet_ref: droplet.map(NamedRef::new),
                        lifecycle: Lifecycle::default(),
                        env_secret_name: Some("app-1-env".to_string()),
                    },
                ),
            )
            .await
            .unwrap();

        let build = store
            .create(
                NS,
                &CanopyBuild::new(
                    "build-1",
                    CanopyBuildSpec {
                        package_ref: NamedRef::new("pkg-1"),
                        app_ref: NamedRef::new("app-1"),
                        staging_memory_mb: 0,
                        staging_disk_mb: 0,
                        lifecycle: Lifecycle::default(),
                    },
                ),
            )
            .await
            .unwrap();
        let mut build = build;
        build.status = Some(BuildStatus {
            observed_generation: 1,
            conditions: vec![],
            droplet: Some(DropletStatus {
                registry: Registry {
                    image: "registry/droplets/build-1".to_string(),
                    image_pull_secrets: vec![NamedRef::new("registry-creds")],
                },
                stack: "cflinuxfs4".to_string(),
                process_types: vec![],
                ports: vec![],
            }),
        });
        store.replace_status(NS, &build).await.unwrap();
    }

    async fn create_task(store: &MemoryStore, name: &str) {
        store
            .create(
                NS,
                &CanopyTask::new(
                    name,
                    CanopyTaskSpec {
                        command: vec!["rake".to_string(), "db:migrate".to_string()],
                        app_ref: NamedRef::new("app-1"),
                        canceled: false,
                    },
                ),
            )
            .await
            .unwrap();
    }

    async fn run(ctx: &Arc<ControllerContext<MemoryStore>>, name: &str) -> Action {
        let task: CanopyTask = ctx.store.get(NS, name).await.unwrap();
        reconcile(Arc::new(task), ctx.clone()).await.unwrap()
    }

    async fn set_workload_condition(store: &MemoryStore, name: &str, r#type: &str) {
        let mut workload: TaskWorkload = store.get(NS, name).await.unwrap();
        let mut status = workload.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(r#type, ConditionStatus::True, "Runner", "exit status 1", Some(1), Utc::now()),
        );
        workload.status = Some(status);
        store.replace_status(NS, &workload).await.unwrap();
    }

    #[tokio::test]
    async fn test_initializes_and_creates_workload() {
        let store = MemoryStore::new();
        seed(&store, Some("build-1")).await;
        create_task(&store, "task-1").await;
        let ctx = ctx(&store);

        run(&ctx, "task-1").await;

        let task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        assert!(is_initialized(&task));
        let status = task.status.clone().unwrap();
        assert_eq!(status.sequence_id, 1);
        assert_eq!(status.memory_mb, 500);
        assert_eq!(status.disk_quota_mb, 1024);
        assert_eq!(status.droplet_ref, Some(NamedRef::new("build-1")));

        let workload: TaskWorkload = store.get(NS, "task-1").await.unwrap();
        assert!(is_owned_by(&workload, &task));
        assert_eq!(workload.spec.image, "registry/droplets/build-1");
        assert_eq!(workload.spec.command, vec!["rake", "db:migrate"]);
        assert_eq!(workload.spec.memory_mb, 500);
        assert_eq!(workload.spec.env_secret_name.as_deref(), Some("app-1-env"));

        let app: CanopyApp = store.get(NS, "app-1").await.unwrap();
        assert!(is_owned_by(&task, &app));
        assert_eq!(app.annotations().get(TASK_SEQUENCE_ANNOTATION).map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_sequence_ids_increase_per_app() {
        let store = MemoryStore::new();
        seed(&store, Some("build-1")).await;
        let ctx = ctx(&store);
        for name in ["task-1", "task-2", "task-3"] {
            create_task(&store, name).await;
            run(&ctx, name).await;
        }

        let mut ids: Vec<i64> = store
            .objects::<CanopyTask>(NS)
            .iter()
            .map(|t| t.status.as_ref().unwrap().sequence_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_corrupt_sequence_annotation_fails_initialization() {
        let store = MemoryStore::new();
        seed(&store, Some("build-1")).await;
        let mut app: CanopyApp = store.get(NS, "app-1").await.unwrap();
        app.annotations_mut()
            .insert(TASK_SEQUENCE_ANNOTATION.to_string(), "seven".to_string());
        store.replace(NS, &app).await.unwrap();
        create_task(&store, "task-1").await;

        let action = run(&ctx(&store), "task-1").await;
        assert_eq!(action, Action::await_change());

        let task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        assert!(!is_initialized(&task));
        let initialized = find_condition(task.conditions(), TASK_INITIALIZED).unwrap();
        assert_eq!(initialized.status, ConditionStatus::False);
        assert_eq!(initialized.reason, REASON_INVALID_SEQUENCE_ID);
        assert!(initialized.message.contains("seven"));

        // The counter is left alone rather than restarted
        let app: CanopyApp = store.get(NS, "app-1").await.unwrap();
        assert_eq!(app.annotations().get(TASK_SEQUENCE_ANNOTATION).map(String::as_str), Some("seven"));
        assert!(store.objects::<TaskWorkload>(NS).is_empty());
    }

    #[tokio::test]
    async fn test_app_without_droplet_is_not_initialized() {
        let store = MemoryStore::new();
        seed(&store, None).await;
        create_task(&store, "task-1").await;

        run(&ctx(&store), "task-1").await;

        let task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        let initialized = find_condition(task.conditions(), TASK_INITIALIZED).unwrap();
        assert_eq!(initialized.status, ConditionStatus::False);
        assert_eq!(initialized.reason, "DropletNotFound");
        assert!(store.objects::<TaskWorkload>(NS).is_empty());
        let app: CanopyApp = store.get(NS, "app-1").await.unwrap();
        assert!(app.annotations().get(TASK_SEQUENCE_ANNOTATION).is_none());
    }

    #[tokio::test]
    async fn test_mirrors_runner_progress() {
        let store = MemoryStore::new();
        seed(&store, Some("build-1")).await;
        create_task(&store, "task-1").await;
        let ctx = ctx(&store);
        run(&ctx, "task-1").await;

        set_workload_condition(&store, "task-1", TASK_STARTED).await;
        run(&ctx, "task-1").await;
        let task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        assert_eq!(task_state(&task).0, TaskState::Running);

        set_workload_condition(&store, "task-1", TASK_FAILED).await;
        let action = run(&ctx, "task-1").await;
        let task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        assert_eq!(
            task_state(&task),
            (TaskState::Failed, Some("exit status 1".to_string()))
        );
        assert_eq!(condition_status(task.conditions(), TASK_SUCCEEDED), ConditionStatus::Unknown);
        // Requeued for the time-to-live deletion
        assert_ne!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_cancel_deletes_workload() {
        let store = MemoryStore::new();
        seed(&store, Some("build-1")).await;
        create_task(&store, "task-1").await;
        let ctx = ctx(&store);
        run(&ctx, "task-1").await;
        assert_eq!(store.objects::<TaskWorkload>(NS).len(), 1);

        let mut task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        task.spec.canceled = true;
        store.replace(NS, &task).await.unwrap();
        run(&ctx, "task-1").await;

        let task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        let canceled = find_condition(task.conditions(), TASK_CANCELED).unwrap();
        assert!(canceled.is_true());
        let failed = find_condition(task.conditions(), TASK_FAILED).unwrap();
        assert_eq!(failed.reason, REASON_TASK_CANCELED);
        assert_eq!(
            task_state(&task),
            (TaskState::Failed, Some(CANCELED_FAILURE_REASON.to_string()))
        );
        assert!(store.objects::<TaskWorkload>(NS).is_empty());
    }

    #[tokio::test]
    async fn test_expired_task_is_deleted() {
        let store = MemoryStore::new();
        seed(&store, Some("build-1")).await;
        create_task(&store, "task-1").await;
        let config = ControllerConfig {
            task_ttl_seconds: 1,
            ..Default::default()
        };
        let ctx = ctx_with(&store, config);
        run(&ctx, "task-1").await;

        // Completed well before the one-second time-to-live
        let mut task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        let mut status = task.status.clone().unwrap();
        set_condition(
            &mut status.conditions,
            Condition::new(
                TASK_SUCCEEDED,
                ConditionStatus::True,
                "Runner",
                "",
                task.metadata.generation,
                Utc::now() - chrono::Duration::seconds(60),
            ),
        );
        task.status = Some(status);
        store.replace_status(NS, &task).await.unwrap();

        run(&ctx, "task-1").await;
        assert!(store.get_opt::<CanopyTask>(NS, "task-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_command_fails_initialization() {
        let store = MemoryStore::new();
        seed(&store, Some("build-1")).await;
        store
            .create(
                NS,
                &CanopyTask::new(
                    "task-1",
                    CanopyTaskSpec {
                        command: vec![" ".to_string()],
                        app_ref: NamedRef::new("app-1"),
                        canceled: false,
                    },
                ),
            )
            .await
            .unwrap();

        run(&ctx(&store), "task-1").await;

        let task: CanopyTask = store.get(NS, "task-1").await.unwrap();
        let initialized = find_condition(task.conditions(), TASK_INITIALIZED).unwrap();
        assert_eq!(initialized.reason, "InvalidSpec");
        assert!(initialized.message.contains("must not be empty"));
    }
}
