//! Task Lifecycle Integration Tests
//!
//! Runs the task repository against an in-memory store while the real task
//! controller reconciles in the background and a fake runner reports workload
//! progress. Covers the blocking create and cancel calls, visibility rules and
//! the per-app sequence ids.
//!
//! Run with: cargo test -p canopy-api --test task_lifecycle -- --nocapture

use anyhow::Result;
use canopy_api::prelude::*;
use canopy_core::conditions::{set_condition, Condition, ConditionStatus};
use canopy_core::crd::{
    BuildStatus, CanopyApp, CanopyAppSpec, CanopyBuild, CanopyBuildSpec, CanopySpace,
    CanopySpaceSpec, CanopyTask, DesiredState, DropletStatus, Lifecycle, NamedRef, Registry,
    TaskWorkload, TASK_INITIALIZED, TASK_STARTED, TASK_SUCCEEDED,
};
use canopy_core::state::task::{TaskState, CANCELED_FAILURE_REASON};
use canopy_core::store::Store;
use canopy_operator::config::ControllerConfig;
use canopy_operator::controller::ControllerContext;
use canopy_operator::task_controller::reconcile;
use chrono::Utc;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

const ORG: &str = "org-1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("canopy_api=debug,canopy_operator=info")
        .with_test_writer()
        .try_init();
}

fn alice(timeout: Duration) -> RequestContext {
    RequestContext::new(Identity::user("alice"), timeout)
}

/// A space holding one app, optionally with a staged droplet
async fn seed_space(store: &MemoryStore, space: &str, app: &str, droplet: Option<&str>) -> Result<()> {
    store
        .create(
            ORG,
            &CanopySpace::new(
                space,
                CanopySpaceSpec {
                    display_name: space.to_string(),
                },
            ),
        )
        .await?;
    store
        .create(
            space,
            &CanopyApp::new(
                app,
                CanopyAppSpec {
                    display_name: app.to_string(),
                    desired_state: DesiredState::Started,
                    current_droplet_ref: droplet.map(NamedRef::new),
                    lifecycle: Lifecycle::default(),
                    env_secret_name: None,
                },
            ),
        )
        .await?;

    if let Some(droplet) = droplet {
        let mut build = store
            .create(
                space,
                &CanopyBuild::new(
                    droplet,
                    CanopyBuildSpec {
                        package_ref: NamedRef::new("package-1"),
                        app_ref: NamedRef::new(app),
                        staging_memory_mb: 0,
                        staging_disk_mb: 0,
                        lifecycle: Lifecycle::default(),
                    },
                ),
            )
            .await?;
        build.status = Some(BuildStatus {
            observed_generation: 1,
            conditions: vec![],
            droplet: Some(DropletStatus {
                registry: Registry {
                    image: format!("registry.local/droplets/{droplet}"),
                    image_pull_secrets: vec![],
                },
                stack: "cflinuxfs4".to_string(),
                process_types: vec![],
                ports: vec![],
            }),
        });
        store.replace_status(space, &build).await?;
    }
    Ok(())
}

/// Reconcile every task every 50ms, the way the controller would on events
fn spawn_task_controller(store: &MemoryStore) -> JoinHandle<()> {
    let store = store.clone();
    tokio::spawn(async move {
        let ctx = Arc::new(ControllerContext::new(
            store.clone(),
            Arc::new(ControllerConfig::default()),
        ));
        loop {
            for task in store.objects::<CanopyTask>("") {
                let _ = reconcile(Arc::new(task), ctx.clone()).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

/// What the runner would write to a task workload
async fn report(store: &MemoryStore, namespace: &str, task: &str, condition: &str) -> Result<()> {
    let mut workload: TaskWorkload = store.get(namespace, task).await?;
    let generation = workload.metadata.generation;
    let mut status = workload.status.take().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new(condition, ConditionStatus::True, condition, "", generation, Utc::now()),
    );
    workload.status = Some(status);
    store.replace_status(namespace, &workload).await?;
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn create_message(app: &str) -> CreateTaskMessage {
    CreateTaskMessage {
        app_guid: app.to_string(),
        command: vec!["rake".to_string(), "db:migrate".to_string()],
        ..Default::default()
    }
}

// =============================================================================
// CREATE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_returns_initialized_task() -> Result<()> {
    init_tracing();
    let store = MemoryStore::new();
    seed_space(&store, "space-1", "app-1", Some("build-1")).await?;
    let controller = spawn_task_controller(&store);
    let repo = TaskRepo::new(store.clone());

    let first = repo.create(&alice(Duration::from_secs(5)), create_message("app-1")).await?;
    let second = repo.create(&alice(Duration::from_secs(5)), create_message("app-1")).await?;
    info!(first = first.sequence_id, second = second.sequence_id, "Created tasks");

    assert_eq!(first.state, TaskState::Pending);
    assert_eq!(first.sequence_id, 1);
    assert_eq!(second.sequence_id, 2);
    assert_eq!(first.droplet_guid.as_deref(), Some("build-1"));
    assert_eq!(first.memory_mb, 500);

    controller.abort();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_create_times_out_when_never_initialized() -> Result<()> {
    init_tracing();
    let store = MemoryStore::new();
    // No droplet, so the controller can never initialize the task
    seed_space(&store, "space-1", "app-1", None).await?;
    let controller = spawn_task_controller(&store);
    let repo = TaskRepo::new(store.clone());

    let start = tokio::time::Instant::now();
    let err = repo
        .create(&alice(Duration::from_secs(2)), create_message("app-1"))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, Error::Timeout { ref condition, .. } if condition == TASK_INITIALIZED));
    assert!(elapsed < Duration::from_secs(2) + Duration::from_millis(50));

    // The task exists but stays invisible
    let task = &store.objects::<CanopyTask>("space-1")[0];
    let err = repo
        .get(&alice(Duration::from_secs(1)), &task.name_any())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    controller.abort();
    Ok(())
}

// =============================================================================
// RUNNER PROGRESS AND CANCELLATION
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_get_follows_runner_progress() -> Result<()> {
    init_tracing();
    let store = MemoryStore::new();
    seed_space(&store, "space-1", "app-1", Some("build-1")).await?;
    let controller = spawn_task_controller(&store);
    let repo = TaskRepo::new(store.clone());
    let ctx = alice(Duration::from_secs(5));

    let task = repo.create(&ctx, create_message("app-1")).await?;
    settle().await;

    report(&store, "space-1", &task.guid, TASK_STARTED).await?;
    settle().await;
    assert_eq!(repo.get(&ctx, &task.guid).await?.state, TaskState::Running);

    report(&store, "space-1", &task.guid, TASK_SUCCEEDED).await?;
    settle().await;
    assert_eq!(repo.get(&ctx, &task.guid).await?.state, TaskState::Succeeded);

    controller.abort();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_overrides_success() -> Result<()> {
    init_tracing();
    let store = MemoryStore::new();
    seed_space(&store, "space-1", "app-1", Some("build-1")).await?;
    let controller = spawn_task_controller(&store);
    let repo = TaskRepo::new(store.clone());
    let ctx = alice(Duration::from_secs(5));

    let task = repo.create(&ctx, create_message("app-1")).await?;
    settle().await;
    report(&store, "space-1", &task.guid, TASK_SUCCEEDED).await?;
    settle().await;

    let canceled = repo.cancel(&ctx, &task.guid).await?;
    assert_eq!(canceled.state, TaskState::Failed);
    assert_eq!(canceled.failure_reason.as_deref(), Some(CANCELED_FAILURE_REASON));

    settle().await;
    assert!(store.objects::<TaskWorkload>("space-1").is_empty());

    controller.abort();
    Ok(())
}

// =============================================================================
// LIST
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_list_skips_forbidden_spaces() -> Result<()> {
    init_tracing();
    let store = MemoryStore::new();
    seed_space(&store, "space-1", "app-1", Some("build-1")).await?;
    seed_space(&store, "space-2", "app-2", Some("build-2")).await?;
    let controller = spawn_task_controller(&store);
    let repo = TaskRepo::new(store.clone());
    let ctx = alice(Duration::from_secs(5));

    repo.create(&ctx, create_message("app-1")).await?;
    repo.create(&ctx, create_message("app-1")).await?;
    repo.create(&ctx, create_message("app-2")).await?;

    let all = repo.list(&ctx, &ListTasksMessage::default()).await?;
    assert_eq!(all.len(), 3);

    let second = repo
        .list(
            &ctx,
            &ListTasksMessage {
                app_guids: vec!["app-1".to_string()],
                sequence_ids: vec![2],
            },
        )
        .await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].sequence_id, 2);

    store.deny("alice", "space-2");
    let visible = repo.list(&ctx, &ListTasksMessage::default()).await?;
    assert_eq!(visible.len(), 2);
    assert!(visible.iter().all(|t| t.app_guid == "app-1"));

    controller.abort();
    Ok(())
}
