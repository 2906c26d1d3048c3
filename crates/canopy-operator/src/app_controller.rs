//! CanopyApp Controller
//!
//! Keeps one `AppWorkload` per started app, running the app's current droplet
//! at the app's revision, and reports readiness from what the runner says
//! about that revision.

use crate::config::ControllerConfig;
use crate::controller::{
    drive, namespace_of, object_key, watch_api, ControllerContext, ControllerMetrics,
};
use crate::error::{OperatorError, Result};
use canopy_core::conditions::{set_condition, Condition, ConditionStatus, READY};
use canopy_core::crd::{
    AppWorkload, AppWorkloadSpec, CanopyApp, CanopyBuild, DesiredState, DropletStatus,
};
use canopy_core::labels::APP_GUID_LABEL;
use canopy_core::state::app::{next_app_status, REASON_DROPLET_NOT_FOUND, REASON_INVALID_REVISION};
use canopy_core::state::deployment::revision_of;
use canopy_core::state::Transition;
use canopy_core::store::{set_owner, KubeStore, Store};
use chrono::Utc;
use kube::api::ObjectMeta;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Start the CanopyApp controller
pub async fn run_app_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    namespace: Option<String>,
) -> Result<()> {
    let ctx = Arc::new(
        ControllerContext::new(KubeStore::new(client.clone()), config)
            .with_metrics(ControllerMetrics::new("app")),
    );

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting CanopyApp controller"
    );

    let controller = Controller::new(
        watch_api::<CanopyApp>(&client, namespace.as_deref()),
        Config::default(),
    )
    .owns(
        watch_api::<AppWorkload>(&client, namespace.as_deref()),
        Config::default(),
    );
    drive("app", controller, reconcile::<KubeStore>, error_policy::<KubeStore>, ctx).await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(app, ctx), fields(name = %app.name_any(), namespace = app.namespace()))]
pub async fn reconcile<S: Store>(app: Arc<CanopyApp>, ctx: Arc<ControllerContext<S>>) -> Result<Action> {
    let key = object_key(app.as_ref());
    ctx.track(&key, apply_app(app, &ctx)).await
}

pub fn error_policy<S: Store>(
    app: Arc<CanopyApp>,
    error: &OperatorError,
    ctx: Arc<ControllerContext<S>>,
) -> Action {
    ctx.backoff(&object_key(app.as_ref()), error)
}

async fn apply_app<S: Store>(app: Arc<CanopyApp>, ctx: &ControllerContext<S>) -> Result<Action> {
    let store = &ctx.store;
    let namespace = namespace_of(app.as_ref())?;
    let name = app.name_any();

    let workload = match (app.spec.desired_state, app.current_droplet()) {
        (DesiredState::Started, Some(droplet_name)) => {
            let revision = match revision_of(&app) {
                Ok(revision) => revision,
                Err(e) => {
                    warn!(name = %name, error = %e, "App revision is not a number");
                    fail_app(store, &app, &namespace, REASON_INVALID_REVISION, &e.to_string()).await?;
                    return Ok(Action::await_change());
                }
            };
            let droplet = store
                .get_opt::<CanopyBuild>(&namespace, droplet_name)
                .await?
                .and_then(|build| build.status)
                .and_then(|status| status.droplet);
            let Some(droplet) = droplet else {
                let message = format!("droplet {droplet_name} of app {name} not found");
                warn!(name = %name, droplet = %droplet_name, "Current droplet not found");
                fail_app(store, &app, &namespace, REASON_DROPLET_NOT_FOUND, &message).await?;
                return Ok(Action::await_change());
            };
            Some(apply_workload(store, &app, droplet, revision, &namespace).await?)
        }
        _ => {
            stop_workload(store, &namespace, &name).await?;
            None
        }
    };

    if let Transition::Update(status) = next_app_status(&app, workload.as_ref(), Utc::now()) {
        debug!(name = %name, "Updating app status");
        let mut updated = app.as_ref().clone();
        updated.status = Some(status);
        store.replace_status(&namespace, &updated).await?;
    }

    Ok(ctx.requeue())
}

/// Report the app as not runnable until its spec changes
async fn fail_app<S: Store>(
    store: &S,
    app: &CanopyApp,
    namespace: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let generation = app.metadata.generation;
    let mut status = app.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new(READY, ConditionStatus::False, reason, message, generation, Utc::now()),
    );
    if app.status.as_ref() != Some(&status) {
        let mut updated = app.clone();
        updated.status = Some(status);
        store.replace_status(namespace, &updated).await?;
    }
    Ok(())
}

/// The workload the app should have for `droplet` at `revision`
fn desired_workload(
    app: &CanopyApp,
    droplet: DropletStatus,
    revision: u64,
    namespace: &str,
) -> Result<AppWorkload> {
    let mut workload = AppWorkload {
        metadata: ObjectMeta {
            name: Some(app.name_any()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(APP_GUID_LABEL.to_string(), app.name_any())])),
            ..Default::default()
        },
        spec: AppWorkloadSpec {
            app_guid: app.name_any(),
            revision: revision.to_string(),
            image: droplet.registry.image,
            image_pull_secrets: droplet.registry.image_pull_secrets,
            processes: droplet.process_types,
            ports: droplet.ports,
            env_secret_name: app.spec.env_secret_name.clone(),
        },
        status: None,
    };
    set_owner(app, &mut workload)?;
    Ok(workload)
}

/// Create or update the app's workload; returns the stored workload
async fn apply_workload<S: Store>(
    store: &S,
    app: &CanopyApp,
    droplet: DropletStatus,
    revision: u64,
    namespace: &str,
) -> Result<AppWorkload> {
    let desired = desired_workload(app, droplet, revision, namespace)?;

    match store.get_opt::<AppWorkload>(namespace, &app.name_any()).await? {
        None => {
            let created = store.create(namespace, &desired).await?;
            info!(app = %app.name_any(), revision = %created.spec.revision, "Created app workload");
            Ok(created)
        }
        Some(existing) if existing.spec == desired.spec => Ok(existing),
        Some(mut existing) => {
            existing.spec = desired.spec;
            let updated = store.replace(namespace, &existing).await?;
            info!(app = %app.name_any(), revision = %updated.spec.revision, "Updated app workload");
            Ok(updated)
        }
    }
}

async fn stop_workload<S: Store>(store: &S, namespace: &str, name: &str) -> Result<()> {
    match store.delete::<AppWorkload>(namespace, name).await {
        Ok(()) => {
            info!(app = %name, "Deleted workload of stopped app");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
