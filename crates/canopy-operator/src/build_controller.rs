//! CanopyBuild Controller
//!
//! Stages a package into a droplet. The controller hands the package to the
//! build service by creating a `BuildWorkload` owned by the build, then
//! mirrors the workload's progress into the build's conditions. When the
//! workload succeeds, the staged image is inspected for process types and
//! ports, and the droplet is recorded on the build.
//!
//! A succeeded build becomes the app's current droplet when the app has none
//! yet, and older succeeded builds beyond the retention limit are deleted.

use crate::controller::{
    drive, namespace_of, object_key, validation_message, watch_api, ControllerContext,
    ControllerMetrics,
};
use crate::config::ControllerConfig;
use crate::error::Result;
use async_trait::async_trait;
use canopy_core::conditions::{is_condition_true, set_condition, Condition, ConditionStatus, Conditioned};
use canopy_core::crd::{
    BuildWorkload, BuildWorkloadSpec, CanopyApp, CanopyBuild, CanopyPackage, CanopyServiceBinding,
    NamedRef, BINDING_SECRET_AVAILABLE, BUILD_STAGING, BUILD_SUCCEEDED,
};
use canopy_core::labels::{APP_GUID_LABEL, BUILD_GUID_LABEL};
use canopy_core::state::build::{
    build_state, next_build_status, BuildObservation, BuildState, ImageConfig,
    REASON_BUILD_NOT_RUNNING,
};
use canopy_core::state::Transition;
use canopy_core::store::{is_owned_by, set_owner, KubeStore, ListOptions, Store};
use canopy_core::Error;
use chrono::Utc;
use kube::api::ObjectMeta;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Reads the process types and ports of a staged image
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn inspect(&self, workload: &BuildWorkload) -> canopy_core::Result<ImageConfig>;
}

/// Takes the image configuration the build service reported on the workload
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadImageInspector;

#[async_trait]
impl ImageInspector for WorkloadImageInspector {
    async fn inspect(&self, workload: &BuildWorkload) -> canopy_core::Result<ImageConfig> {
        let droplet = workload
            .status
            .as_ref()
            .and_then(|s| s.droplet.as_ref())
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "build workload {} reports no image",
                    workload.name_any()
                ))
            })?;
        Ok(ImageConfig {
            process_types: droplet.process_types.clone().unwrap_or_default(),
            ports: droplet.ports.clone().unwrap_or_default(),
        })
    }
}

/// Start the CanopyBuild controller
pub async fn run_build_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    namespace: Option<String>,
) -> Result<()> {
    let ctx = Arc::new(
        ControllerContext::new(KubeStore::new(client.clone()), config)
            .with_metrics(ControllerMetrics::new("build")),
    );

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting CanopyBuild controller"
    );

    let controller = Controller::new(
        watch_api::<CanopyBuild>(&client, namespace.as_deref()),
        Config::default(),
    )
    .owns(
        watch_api::<BuildWorkload>(&client, namespace.as_deref()),
        Config::default(),
    );
    drive("build", controller, reconcile::<KubeStore>, error_policy::<KubeStore>, ctx).await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(build, ctx), fields(name = %build.name_any(), namespace = build.namespace()))]
pub async fn reconcile<S: Store>(build: Arc<CanopyBuild>, ctx: Arc<ControllerContext<S>>) -> Result<Action> {
    let key = object_key(build.as_ref());
    ctx.track(&key, apply_build(build, &ctx)).await
}

pub fn error_policy<S: Store>(
    build: Arc<CanopyBuild>,
    error: &crate::error::OperatorError,
    ctx: Arc<ControllerContext<S>>,
) -> Action {
    ctx.backoff(&object_key(build.as_ref()), error)
}

async fn apply_build<S: Store>(build: Arc<CanopyBuild>, ctx: &ControllerContext<S>) -> Result<Action> {
    let store = &ctx.store;
    let namespace = namespace_of(build.as_ref())?;
    let name = build.name_any();

    if let Err(errors) = build.spec.validate() {
        let message = validation_message(&errors);
        warn!(name = %name, errors = %message, "Build spec validation failed");
        fail_invalid(store, &build, &namespace, &message).await?;
        return Ok(Action::await_change());
    }

    let app: Option<CanopyApp> = store.get_opt(&namespace, &build.spec.app_ref.name).await?;
    let package: Option<CanopyPackage> = store
        .get_opt(&namespace, &build.spec.package_ref.name)
        .await?;

    if build_state(&build) != BuildState::Staging {
        if let Some(app) = &app {
            finish_build(ctx, &build, app, &namespace).await?;
        }
        return Ok(Action::await_change());
    }

    let mut build = build.as_ref().clone();
    if let Some(app) = &app {
        if !is_owned_by(&build, app) {
            set_owner(app, &mut build)?;
            build = store.replace(&namespace, &build).await?;
        }
    }

    let workload = match (&app, &package) {
        (Some(app), Some(package)) => {
            Some(ensure_workload(store, &build, app, package, &namespace).await?)
        }
        _ => None,
    };

    let image = match &workload {
        Some(w) if is_condition_true(w.conditions(), BUILD_SUCCEEDED) => {
            Some(ctx.image_inspector.inspect(w).await?)
        }
        _ => None,
    };

    let observed = BuildObservation {
        app: app.as_ref(),
        package: package.as_ref(),
        workload: workload.as_ref(),
        image: image.as_ref(),
    };
    if let Transition::Update(status) = next_build_status(&build, &observed, Utc::now()) {
        debug!(name = %name, "Updating build status");
        build.status = Some(status);
        build = store.replace_status(&namespace, &build).await?;
    }

    match (build_state(&build), &app) {
        (BuildState::Staging, _) => Ok(Action::await_change()),
        (state, Some(app)) => {
            info!(name = %name, state = state.as_str(), "Build finished");
            finish_build(ctx, &build, app, &namespace).await?;
            Ok(Action::await_change())
        }
        (_, None) => Ok(Action::await_change()),
    }
}

/// A build whose spec is invalid fails without staging
async fn fail_invalid<S: Store>(
    store: &S,
    build: &CanopyBuild,
    namespace: &str,
    message: &str,
) -> Result<()> {
    let generation = build.metadata.generation;
    let mut status = build.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    let now = Utc::now();
    set_condition(
        &mut status.conditions,
        Condition::new(BUILD_STAGING, ConditionStatus::False, REASON_BUILD_NOT_RUNNING, "", generation, now),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(BUILD_SUCCEEDED, ConditionStatus::False, "InvalidSpec", message, generation, now),
    );
    if build.status.as_ref() != Some(&status) {
        let mut updated = build.clone();
        updated.status = Some(status);
        store.replace_status(namespace, &updated).await?;
    }
    Ok(())
}

/// Get the build's workload, creating it from the package on first sight
async fn ensure_workload<S: Store>(
    store: &S,
    build: &CanopyBuild,
    app: &CanopyApp,
    package: &CanopyPackage,
    namespace: &str,
) -> Result<BuildWorkload> {
    let name = build.name_any();
    if let Some(existing) = store.get_opt::<BuildWorkload>(namespace, &name).await? {
        return Ok(existing);
    }

    let services = bound_secrets(store, app, namespace).await?;
    let lifecycle = if build.spec.lifecycle.buildpacks.is_empty() && build.spec.lifecycle.stack.is_empty() {
        &app.spec.lifecycle
    } else {
        &build.spec.lifecycle
    };

    let mut workload = BuildWorkload {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (APP_GUID_LABEL.to_string(), app.name_any()),
                (BUILD_GUID_LABEL.to_string(), name.clone()),
            ])),
            ..Default::default()
        },
        spec: BuildWorkloadSpec {
            build_ref: NamedRef::new(name.clone()),
            source: package.spec.source.clone(),
            buildpacks: lifecycle.buildpacks.clone(),
            stack: lifecycle.stack.clone(),
            env_secret_name: app.spec.env_secret_name.clone(),
            services,
        },
        status: None,
    };
    set_owner(build, &mut workload)?;

    match store.create(namespace, &workload).await {
        Ok(created) => {
            info!(name = %name, "Created build workload");
            Ok(created)
        }
        Err(Error::AlreadyExists { .. }) => Ok(store.get(namespace, &name).await?),
        Err(e) => Err(e.into()),
    }
}

/// Credential secrets of the app's bindings that resolved their secret
async fn bound_secrets<S: Store>(store: &S, app: &CanopyApp, namespace: &str) -> Result<Vec<NamedRef>> {
    let app_name = app.name_any();
    let bindings = store
        .list::<CanopyServiceBinding>(namespace, &ListOptions::default())
        .await?;
    Ok(bindings
        .items
        .into_iter()
        .filter(|b| b.spec.app_ref.name == app_name)
        .filter(|b| is_condition_true(b.conditions(), BINDING_SECRET_AVAILABLE))
        .filter_map(|b| b.status.and_then(|s| s.binding))
        .collect())
}

/// Cross-object effects of a finished build
async fn finish_build<S: Store>(
    ctx: &ControllerContext<S>,
    build: &CanopyBuild,
    app: &CanopyApp,
    namespace: &str,
) -> Result<()> {
    if build_state(build) != BuildState::Staged {
        return Ok(());
    }
    if app.current_droplet().is_none() {
        let mut updated = app.clone();
        updated.spec.current_droplet_ref = Some(NamedRef::new(build.name_any()));
        ctx.store.replace(namespace, &updated).await?;
        info!(app = %app.name_any(), droplet = %build.name_any(), "Assigned first droplet to app");
    }
    prune_builds(ctx, app, namespace).await
}

/// Delete the oldest succeeded builds of `app` beyond the retention limit,
/// never the app's current droplet
async fn prune_builds<S: Store>(ctx: &ControllerContext<S>, app: &CanopyApp, namespace: &str) -> Result<()> {
    let keep = ctx.config.max_retained_builds_per_app;
    let app_name = app.name_any();
    let current = app.current_droplet().map(str::to_string);

    let mut staged: Vec<CanopyBuild> = ctx
        .store
        .list::<CanopyBuild>(namespace, &ListOptions::default())
        .await?
        .items
        .into_iter()
        .filter(|b| b.spec.app_ref.name == app_name && build_state(b) == BuildState::Staged)
        .filter(|b| current.as_deref() != Some(b.name_any().as_str()))
        .collect();
    if staged.len() <= keep {
        return Ok(());
    }

    // Newest first; names break ties so the order is stable
    staged.sort_by(|a, b| {
        b.creation_timestamp()
            .cmp(&a.creation_timestamp())
            .then_with(|| b.name_any().cmp(&a.name_any()))
    });
    for old in staged.iter().skip(keep) {
        match ctx.store.delete::<CanopyBuild>(namespace, &old.name_any()).await {
            Ok(()) => info!(build = %old.name_any(), app = %app_name, "Deleted old build"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
