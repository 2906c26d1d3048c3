//! CanopyOrg and CanopySpace Controller
//!
//! Every tenant is backed by a namespace named after it. An org lives in the
//! root namespace and a space lives in its org's namespace; that namespace is
//! the parent whose registry secrets and opted-in role bindings are propagated
//! into the tenant's own namespace. Orgs and spaces share one reconcile,
//! generic over [`Tenant`].
//!
//! Deleting a tenant deletes its namespace before the finalizer is released.

use crate::config::ControllerConfig;
use crate::controller::{
    add_finalizer, drive, is_deleting, namespace_of, object_key, remove_finalizer,
    validation_message, watch_api, ControllerContext, ControllerMetrics,
};
use crate::error::{OperatorError, Result};
use crate::propagation::{PropagatedKind, PropagationError, PropagationRequest, Propagator};
use canopy_core::conditions::{set_condition, Condition, ConditionStatus, READY};
use canopy_core::crd::{CanopyOrg, CanopySpace};
use canopy_core::identity::Deadline;
use canopy_core::labels::{
    MANAGED_BY_CANOPY, MANAGED_BY_LABEL, POD_SECURITY_AUDIT_LABEL, POD_SECURITY_ENFORCE_LABEL,
};
use canopy_core::state::tenant::{next_tenant_status, Tenant, TenantFailure};
use canopy_core::state::Transition;
use canopy_core::store::{KubeStore, Store};
use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Upper bound on one pass of namespace setup and propagation
const PROPAGATION_WINDOW: Duration = Duration::from_secs(30);

/// Pod security level applied to tenant namespaces
const POD_SECURITY_LEVEL: &str = "restricted";

/// Start the CanopyOrg controller
pub async fn run_org_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    namespace: Option<String>,
) -> Result<()> {
    let ctx = Arc::new(
        ControllerContext::new(KubeStore::new(client.clone()), config)
            .with_metrics(ControllerMetrics::new("org")),
    );

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting CanopyOrg controller"
    );

    let controller = Controller::new(
        watch_api::<CanopyOrg>(&client, namespace.as_deref()),
        Config::default(),
    );
    drive(
        "org",
        controller,
        reconcile::<KubeStore, CanopyOrg>,
        error_policy::<KubeStore, CanopyOrg>,
        ctx,
    )
    .await;

    Ok(())
}

/// Start the CanopySpace controller
pub async fn run_space_controller(
    client: Client,
    config: Arc<ControllerConfig>,
    namespace: Option<String>,
) -> Result<()> {
    let ctx = Arc::new(
        ControllerContext::new(KubeStore::new(client.clone()), config)
            .with_metrics(ControllerMetrics::new("space")),
    );

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting CanopySpace controller"
    );

    let controller = Controller::new(
        watch_api::<CanopySpace>(&client, namespace.as_deref()),
        Config::default(),
    );
    drive(
        "space",
        controller,
        reconcile::<KubeStore, CanopySpace>,
        error_policy::<KubeStore, CanopySpace>,
        ctx,
    )
    .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(tenant, ctx), fields(kind = %T::kind_name(), name = %tenant.name_any(), namespace = tenant.namespace()))]
pub async fn reconcile<S: Store, T: Tenant>(tenant: Arc<T>, ctx: Arc<ControllerContext<S>>) -> Result<Action> {
    let key = object_key(tenant.as_ref());
    ctx.track(&key, apply_tenant(tenant, &ctx)).await
}

pub fn error_policy<S: Store, T: Tenant>(
    tenant: Arc<T>,
    error: &OperatorError,
    ctx: Arc<ControllerContext<S>>,
) -> Action {
    ctx.backoff(&object_key(tenant.as_ref()), error)
}

/// Labels stamped on a tenant's namespace
fn namespace_labels<T: Tenant>(tenant: &T, parent: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (T::GUID_LABEL.to_string(), tenant.name_any()),
        (POD_SECURITY_ENFORCE_LABEL.to_string(), POD_SECURITY_LEVEL.to_string()),
        (POD_SECURITY_AUDIT_LABEL.to_string(), POD_SECURITY_LEVEL.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_CANOPY.to_string()),
    ]);
    if let Some(key) = T::PARENT_LABEL {
        labels.insert(key.to_string(), parent.to_string());
    }
    labels
}

fn failure_of(error: &PropagationError) -> TenantFailure {
    let message = error.source.to_string();
    match error.kind {
        PropagatedKind::Namespace => TenantFailure::NamespaceCreation(message),
        PropagatedKind::Secret => TenantFailure::SecretPropagation(message),
        PropagatedKind::RoleBinding => TenantFailure::RoleBindingPropagation(message),
    }
}

async fn apply_tenant<S: Store, T: Tenant>(tenant: Arc<T>, ctx: &ControllerContext<S>) -> Result<Action> {
    let store = &ctx.store;
    let parent = namespace_of(tenant.as_ref())?;
    let child = tenant.name_any();

    if is_deleting(tenant.as_ref()) {
        return finalize(store, tenant.as_ref(), &child).await;
    }

    let tenant = add_finalizer(store, tenant.as_ref(), T::FINALIZER).await?;

    if let Some(message) = invalid_display_name(&tenant) {
        warn!(name = %child, errors = %message, "Tenant spec validation failed");
        report_invalid(store, &tenant, &parent, &message).await?;
        return Ok(Action::await_change());
    }

    let propagator = Propagator::new(store.clone());
    let deadline = Deadline::after(PROPAGATION_WINDOW);
    let labels = namespace_labels(&tenant, &parent);
    let annotations = BTreeMap::new();

    let outcome = async {
        propagator
            .ensure_namespace(&child, &labels, &annotations, deadline)
            .await?;
        let request = PropagationRequest {
            parent: &parent,
            child: &child,
            secret_names: &ctx.config.container_registry_secret_names,
            annotation_filter: &ctx.config.role_binding_propagation_annotation,
        };
        propagator.propagate(&request, deadline).await
    }
    .await;

    let failure = outcome.as_ref().err().map(failure_of);
    let result = match &failure {
        None => Ok(()),
        Some(f) => Err(f),
    };
    if let Transition::Update(status) = next_tenant_status(&tenant, &child, result, Utc::now()) {
        debug!(name = %child, ready = failure.is_none(), "Updating tenant status");
        let mut updated = tenant.clone();
        updated.set_tenant_status(status);
        store.replace_status(&parent, &updated).await?;
    }

    match outcome {
        Ok(report) => {
            debug!(
                name = %child,
                secrets = report.secrets.len(),
                role_bindings = report.role_bindings.len(),
                deleted = report.deleted.len(),
                "Tenant namespace converged"
            );
            Ok(ctx.requeue())
        }
        Err(e) => Err(e.into()),
    }
}

/// Validation message when the tenant's display name is out of bounds
fn invalid_display_name<T: Tenant>(tenant: &T) -> Option<String> {
    #[derive(Validate)]
    struct DisplayName {
        #[validate(length(min = 1, max = 255, message = "display name must be 1-255 characters"))]
        display_name: String,
    }

    DisplayName {
        display_name: tenant.display_name().to_string(),
    }
    .validate()
    .err()
    .map(|errors| validation_message(&errors))
}

async fn report_invalid<S: Store, T: Tenant>(
    store: &S,
    tenant: &T,
    namespace: &str,
    message: &str,
) -> Result<()> {
    let generation = tenant.meta().generation;
    let mut status = tenant.tenant_status().cloned().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    set_condition(
        &mut status.conditions,
        Condition::new(READY, ConditionStatus::False, "InvalidSpec", message, generation, Utc::now()),
    );
    if tenant.tenant_status() != Some(&status) {
        let mut updated = tenant.clone();
        updated.set_tenant_status(status);
        store.replace_status(namespace, &updated).await?;
    }
    Ok(())
}

/// Delete the tenant's namespace, then let the tenant go
async fn finalize<S: Store, T: Tenant>(store: &S, tenant: &T, child: &str) -> Result<Action> {
    match store.delete::<Namespace>("", child).await {
        Ok(()) => info!(namespace = %child, "Deleted tenant namespace"),
        Err(e) if e.is_not_found() => debug!(namespace = %child, "Tenant namespace already gone"),
        Err(e) => return Err(e.into()),
    }
    remove_finalizer(store, tenant, T::FINALIZER).await?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::conditions::{find_condition, Conditioned};
    use canopy_core::crd::{CanopyOrgSpec, CanopySpaceSpec};
    use canopy_core::labels::{
        ORG_GUID_LABEL, ORG_NAMESPACE_LABEL, PROPAGATED_FROM_LABEL, SPACE_GUID_LABEL,
    };
    use canopy_core::store::MemoryStore;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    const ROOT: &str = "canopy";

    fn config() -> ControllerConfig {
        ControllerConfig {
            container_registry_secret_names: vec!["registry-creds".to_string()],
            ..Default::default()
        }
    }

    fn ctx(store: &MemoryStore) -> Arc<ControllerContext<MemoryStore>> {
        Arc::new(ControllerContext::new(store.clone(), Arc::new(config())))
    }

    async fn seed_root(store: &MemoryStore) {
        store
            .create(
                ROOT,
                &Secret {
                    metadata: ObjectMeta {
                        name: Some("registry-creds".to_string()),
                        ..Default::default()
                    },
                    type_: Some("kubernetes.io/dockerconfigjson".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    async fn create_org(store: &MemoryStore, display_name: &str) -> CanopyOrg {
        store
            .create(
                ROOT,
                &CanopyOrg::new(
                    "org-1",
                    CanopyOrgSpec {
                        display_name: display_name.to_string(),
                    },
                ),
            )
            .await
            .unwrap()
    }

    async fn run_org(store: &MemoryStore) -> Result<Action> {
        let org: CanopyOrg = store.get(ROOT, "org-1").await.unwrap();
        reconcile(Arc::new(org), ctx(store)).await
    }

    #[tokio::test]
    async fn test_org_gets_namespace_and_secrets() {
        let store = MemoryStore::new();
        seed_root(&store).await;
        create_org(&store, "payments").await;

        run_org(&store).await.unwrap();

        let org: CanopyOrg = store.get(ROOT, "org-1").await.unwrap();
        assert!(org.finalizers().contains(&CanopyOrg::FINALIZER.to_string()));
        assert!(org.condition(READY).unwrap().is_true());
        assert_eq!(org.status.unwrap().guid, "org-1");

        let namespace: Namespace = store.get("", "org-1").await.unwrap();
        let labels = namespace.labels();
        assert_eq!(labels.get(ORG_GUID_LABEL).map(String::as_str), Some("org-1"));
        assert_eq!(
            labels.get(POD_SECURITY_ENFORCE_LABEL).map(String::as_str),
            Some("restricted")
        );
        assert!(labels.get(ORG_NAMESPACE_LABEL).is_none());

        let copy: Secret = store.get("org-1", "registry-creds").await.unwrap();
        assert_eq!(
            copy.labels().get(PROPAGATED_FROM_LABEL).map(String::as_str),
            Some(ROOT)
        );
    }

    #[tokio::test]
    async fn test_space_inherits_from_org() {
        let store = MemoryStore::new();
        seed_root(&store).await;
        create_org(&store, "payments").await;
        run_org(&store).await.unwrap();

        store
            .create(
                "org-1",
                &CanopySpace::new(
                    "space-1",
                    CanopySpaceSpec {
                        display_name: "staging".to_string(),
                    },
                ),
            )
            .await
            .unwrap();
        let space: CanopySpace = store.get("org-1", "space-1").await.unwrap();
        reconcile(Arc::new(space), ctx(&store)).await.unwrap();

        let space: CanopySpace = store.get("org-1", "space-1").await.unwrap();
        assert!(space.condition(READY).unwrap().is_true());

        let namespace: Namespace = store.get("", "space-1").await.unwrap();
        assert_eq!(
            namespace.labels().get(SPACE_GUID_LABEL).map(String::as_str),
            Some("space-1")
        );
        assert_eq!(
            namespace.labels().get(ORG_NAMESPACE_LABEL).map(String::as_str),
            Some("org-1")
        );
        let copy: Secret = store.get("space-1", "registry-creds").await.unwrap();
        assert_eq!(
            copy.labels().get(PROPAGATED_FROM_LABEL).map(String::as_str),
            Some("org-1")
        );
    }

    #[tokio::test]
    async fn test_missing_secret_reports_propagation_failure() {
        let store = MemoryStore::new();
        create_org(&store, "payments").await;

        let err = run_org(&store).await.unwrap_err();
        assert!(matches!(err, OperatorError::Propagation(_)));

        let org: CanopyOrg = store.get(ROOT, "org-1").await.unwrap();
        let ready = find_condition(org.conditions(), READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "SecretPropagation");
        assert!(ready.message.contains("registry-creds"));
        // The namespace itself was still set up
        assert!(store.get_opt::<Namespace>("", "org-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_display_name() {
        let store = MemoryStore::new();
        create_org(&store, "").await;

        run_org(&store).await.unwrap();

        let org: CanopyOrg = store.get(ROOT, "org-1").await.unwrap();
        let ready = find_condition(org.conditions(), READY).unwrap();
        assert_eq!(ready.reason, "InvalidSpec");
        assert!(store.get_opt::<Namespace>("", "org-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_namespace() {
        let store = MemoryStore::new();
        seed_root(&store).await;
        create_org(&store, "payments").await;
        run_org(&store).await.unwrap();

        store.delete::<CanopyOrg>(ROOT, "org-1").await.unwrap();
        run_org(&store).await.unwrap();

        assert!(store.get_opt::<Namespace>("", "org-1").await.unwrap().is_none());
        assert!(store.objects::<Secret>("org-1").is_empty());
        assert!(store.get_opt::<CanopyOrg>(ROOT, "org-1").await.unwrap().is_none());
    }
}
