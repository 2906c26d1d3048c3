//! Controller plumbing shared by every Canopy controller
//!
//! Each controller pairs a reconcile function, generic over the [`Store`] it
//! writes through, with a `run_*` entry point that drives it from a
//! `kube::runtime::Controller` watch. Reconcile functions never talk to the
//! Kubernetes API directly, so the same code runs against [`MemoryStore`]
//! in tests.
//!
//! [`MemoryStore`]: canopy_core::store::MemoryStore

use crate::build_controller::{ImageInspector, WorkloadImageInspector};
use crate::config::ControllerConfig;
use crate::error::{OperatorError, Result};
use canopy_core::store::{Store, StoreObject};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::{Client, Resource, ResourceExt};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use validator::ValidationErrors;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to every controller
pub struct ControllerContext<S: Store> {
    pub store: S,
    pub config: Arc<ControllerConfig>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-object error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Reads process types and ports of staged images
    pub image_inspector: Arc<dyn ImageInspector>,
}

/// Metrics for one controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    pub fn new(controller: &'static str) -> Self {
        Self {
            reconciliations: metrics::counter!(
                "canopy_operator_reconciliations_total",
                "controller" => controller
            ),
            errors: metrics::counter!(
                "canopy_operator_reconciliation_errors_total",
                "controller" => controller
            ),
            duration: metrics::histogram!(
                "canopy_operator_reconciliation_duration_seconds",
                "controller" => controller
            ),
        }
    }
}

impl<S: Store> ControllerContext<S> {
    pub fn new(store: S, config: Arc<ControllerConfig>) -> Self {
        Self {
            store,
            config,
            metrics: None,
            error_counts: dashmap::DashMap::new(),
            image_inspector: Arc::new(WorkloadImageInspector),
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_image_inspector(mut self, inspector: Arc<dyn ImageInspector>) -> Self {
        self.image_inspector = inspector;
        self
    }

    /// Run one reconciliation, recording metrics and resetting the backoff
    /// counter of `key` on success
    pub async fn track<F>(&self, key: &str, reconcile: F) -> Result<Action>
    where
        F: Future<Output = Result<Action>>,
    {
        let start = Instant::now();
        if let Some(ref metrics) = self.metrics {
            metrics.reconciliations.increment(1);
        }

        let result = reconcile.await;

        if let Some(ref metrics) = self.metrics {
            metrics.duration.record(start.elapsed().as_secs_f64());
            if result.is_err() {
                metrics.errors.increment(1);
            }
        }
        if result.is_ok() {
            self.error_counts.remove(key);
        }
        result
    }

    /// Exponential backoff: 30s, 60s, 120s, ... capped at 600s, unless the
    /// error suggests its own delay
    pub fn backoff(&self, key: &str, error: &OperatorError) -> Action {
        let retries = {
            let mut entry = self.error_counts.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let delay = error.requeue_delay().unwrap_or_else(|| {
            let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
            let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
            backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
        });

        warn!(
            error = %error,
            retry = retries,
            delay_secs = delay.as_secs(),
            "Reconciliation error for '{}', will retry",
            key
        );

        Action::requeue(delay)
    }

    pub fn requeue(&self) -> Action {
        Action::requeue(self.config.requeue_interval())
    }
}

/// `namespace/name` of an object, used as backoff key
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Namespace of a namespaced object
pub fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.namespace().ok_or_else(|| {
        OperatorError::InvalidConfig(format!("{} has no namespace", obj.name_any()))
    })
}

/// Flatten validation errors into one message
pub fn validation_message(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{field}: {message}"),
                None => format!("{field}: {}", e.code),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add `finalizer` unless present; returns the stored object
pub async fn add_finalizer<S: Store, K: StoreObject>(store: &S, obj: &K, finalizer: &str) -> Result<K> {
    if has_finalizer(obj, finalizer) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().push(finalizer.to_string());
    let namespace = updated.namespace().unwrap_or_default();
    debug!(name = %obj.name_any(), finalizer = %finalizer, "Adding finalizer");
    Ok(store.replace(&namespace, &updated).await?)
}

/// Drop `finalizer`, letting a deleting object go away
pub async fn remove_finalizer<S: Store, K: StoreObject>(store: &S, obj: &K, finalizer: &str) -> Result<()> {
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().retain(|f| f != finalizer);
    let namespace = updated.namespace().unwrap_or_default();
    debug!(name = %obj.name_any(), finalizer = %finalizer, "Removing finalizer");
    match store.replace(&namespace, &updated).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Api for `K` in the watched namespace, or cluster-wide
pub fn watch_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Drive a configured controller until its watch streams end
pub async fn drive<K, ReconcilerFut, Ctx>(
    name: &'static str,
    controller: Controller<K>,
    reconcile: impl FnMut(Arc<K>, Arc<Ctx>) -> ReconcilerFut,
    error_policy: impl Fn(Arc<K>, &OperatorError, Arc<Ctx>) -> Action,
    ctx: Arc<Ctx>,
) where
    K: Resource + Clone + Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Debug + Eq + Hash + Clone + Unpin,
    ReconcilerFut: Future<Output = Result<Action>> + Send + 'static,
    Ctx: Send + Sync + 'static,
{
    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        controller = name,
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(controller = name, error = %e, "Reconciliation failed");
                }
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::crd::{CanopyOrg, CanopyOrgSpec};
    use canopy_core::store::MemoryStore;
    use validator::Validate;

    fn ctx() -> ControllerContext<MemoryStore> {
        ControllerContext::new(MemoryStore::new(), Arc::new(ControllerConfig::default()))
    }

    fn org(display_name: &str) -> CanopyOrg {
        CanopyOrg::new(
            "org-1",
            CanopyOrgSpec {
                display_name: display_name.to_string(),
            },
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let ctx = ctx();
        let err = OperatorError::InvalidConfig("bad".to_string());
        assert_eq!(ctx.backoff("ns/a", &err), Action::requeue(Duration::from_secs(30)));
        assert_eq!(ctx.backoff("ns/a", &err), Action::requeue(Duration::from_secs(60)));
        for _ in 0..10 {
            ctx.backoff("ns/a", &err);
        }
        assert_eq!(ctx.backoff("ns/a", &err), Action::requeue(Duration::from_secs(600)));
    }

    #[test]
    fn test_backoff_prefers_error_delay() {
        let ctx = ctx();
        let err: OperatorError = canopy_core::Error::Conflict("modified".to_string()).into();
        assert_eq!(ctx.backoff("ns/a", &err), Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let ctx = ctx();
        let err = OperatorError::InvalidConfig("bad".to_string());
        ctx.backoff("ns/a", &err);
        ctx.backoff("ns/a", &err);

        ctx.track("ns/a", async { Ok(Action::await_change()) }).await.unwrap();
        assert!(ctx.error_counts.get("ns/a").is_none());
        assert_eq!(ctx.backoff("ns/a", &err), Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn test_validation_message() {
        let errors = org("").spec.validate().unwrap_err();
        let message = validation_message(&errors);
        assert!(message.starts_with("display_name:"));
        assert!(message.contains("1-255"));
    }

    #[tokio::test]
    async fn test_finalizers() {
        let store = MemoryStore::new();
        let created = store.create("canopy", &org("payments")).await.unwrap();

        let with = add_finalizer(&store, &created, "canopy.io/test").await.unwrap();
        assert!(has_finalizer(&with, "canopy.io/test"));
        let again = add_finalizer(&store, &with, "canopy.io/test").await.unwrap();
        assert_eq!(again.finalizers().len(), 1);

        store.delete::<CanopyOrg>("canopy", "org-1").await.unwrap();
        let deleting: CanopyOrg = store.get("canopy", "org-1").await.unwrap();
        assert!(is_deleting(&deleting));

        remove_finalizer(&store, &deleting, "canopy.io/test").await.unwrap();
        assert!(store.get_opt::<CanopyOrg>("canopy", "org-1").await.unwrap().is_none());
    }

    #[test]
    fn test_object_key() {
        let mut org = org("payments");
        org.metadata.namespace = Some("canopy".to_string());
        assert_eq!(object_key(&org), "canopy/org-1");
    }
}
