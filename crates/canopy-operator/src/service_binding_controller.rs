//! CanopyServiceBinding Controller
//!
//! Resolves a binding's service instance and credentials secret. Bindings are
//! owned by their app so they go away with it. Secrets are not watched; the
//! periodic requeue picks up credentials that appear later.

use crate::config::ControllerConfig;
use crate::controller::{
    drive, namespace_of, object_key, validation_message, watch_api, ControllerContext,
    ControllerMetrics,
};
use crate::error::{OperatorError, Result};
use canopy_core::conditions::{set_condition, Condition, ConditionStatus, READY};
use canopy_core::crd::{
    CanopyApp, CanopyServiceBinding, CanopyServiceInstance, BINDING_SECRET_AVAILABLE,
};
use canopy_core::state::service_binding::{next_binding_status, BindingObservation};
use canopy_core::state::Transition;
use canopy_core::store::{is_owned_by, set_owner, KubeStore, Store};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Start the CanopyServiceBinding controller
pub async fn run_service_binding_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    namespace: Option<String>,
) -> Result<()> {
    let ctx = Arc::new(
        ControllerContext::new(KubeStore::new(client.clone()), config)
            .with_metrics(ControllerMetrics::new("service_binding")),
    );

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting CanopyServiceBinding controller"
    );

    let controller = Controller::new(
        watch_api::<CanopyServiceBinding>(&client, namespace.as_deref()),
        Config::default(),
    );
    drive(
        "service_binding",
        controller,
        reconcile::<KubeStore>,
        error_policy::<KubeStore>,
        ctx,
    )
    .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(binding, ctx), fields(name = %binding.name_any(), namespace = binding.namespace()))]
pub async fn reconcile<S: Store>(
    binding: Arc<CanopyServiceBinding>,
    ctx: Arc<ControllerContext<S>>,
) -> Result<Action> {
    let key = object_key(binding.as_ref());
    ctx.track(&key, apply_binding(binding, &ctx)).await
}

pub fn error_policy<S: Store>(
    binding: Arc<CanopyServiceBinding>,
    error: &OperatorError,
    ctx: Arc<ControllerContext<S>>,
) -> Action {
    ctx.backoff(&object_key(binding.as_ref()), error)
}

async fn apply_binding<S: Store>(
    binding: Arc<CanopyServiceBinding>,
    ctx: &ControllerContext<S>,
) -> Result<Action> {
    let store = &ctx.store;
    let namespace = namespace_of(binding.as_ref())?;
    let name = binding.name_any();

    if let Err(errors) = binding.spec.validate() {
        let message = validation_message(&errors);
        warn!(name = %name, errors = %message, "Binding spec validation failed");
        fail_invalid(store, &binding, &namespace, &message).await?;
        return Ok(Action::await_change());
    }

    let mut binding = binding.as_ref().clone();
    let app: Option<CanopyApp> = store.get_opt(&namespace, &binding.spec.app_ref.name).await?;
    if let Some(app) = &app {
        if !is_owned_by(&binding, app) {
            set_owner(app, &mut binding)?;
            binding = store.replace(&namespace, &binding).await?;
        }
    }

    let instance: Option<CanopyServiceInstance> =
        store.get_opt(&namespace, &binding.spec.service.name).await?;
    let secret: Option<Secret> = match instance.as_ref().map(|i| i.spec.secret_name.as_str()) {
        Some(secret_name) if !secret_name.is_empty() => store.get_opt(&namespace, secret_name).await?,
        _ => None,
    };

    let observed = BindingObservation {
        app: app.as_ref(),
        instance: instance.as_ref(),
        secret: secret.as_ref(),
    };
    if let Transition::Update(status) = next_binding_status(&binding, &observed, Utc::now()) {
        debug!(name = %name, "Updating binding status");
        binding.status = Some(status);
        store.replace_status(&namespace, &binding).await?;
    }

    Ok(ctx.requeue())
}

/// Report an invalid spec on both conditions; nothing is resolved for it
async fn fail_invalid<S: Store>(
    store: &S,
    binding: &CanopyServiceBinding,
    namespace: &str,
    message: &str,
) -> Result<()> {
    let generation = binding.metadata.generation;
    let now = Utc::now();
    let mut status = binding.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    status.binding = None;
    for r#type in [BINDING_SECRET_AVAILABLE, READY] {
        set_condition(
            &mut status.conditions,
            Condition::new(r#type, ConditionStatus::False, "InvalidSpec", message, generation, now),
        );
    }
    if binding.status.as_ref() != Some(&status) {
        let mut updated = binding.clone();
        updated.status = Some(status);
        store.replace_status(namespace, &updated).await?;
    }
    Ok(())
}
