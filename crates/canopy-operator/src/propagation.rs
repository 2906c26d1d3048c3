//! Namespace, secret and role binding propagation
//!
//! Child tenants inherit selected secrets and role bindings from their
//! parent's namespace. Every copy is labeled with the namespace it was
//! propagated from, which is how copies whose source went away are found and
//! removed again.
//!
//! A propagation pass reads everything it needs (source secrets, parent role
//! bindings, the child's existing copies) before it writes anything, so a
//! failed read never leaves the child half-updated.

use canopy_core::error::Error;
use canopy_core::identity::Deadline;
use canopy_core::labels::{
    contains_all, merge_into, selector, strip_package_manager_keys, PROPAGATED_FROM_LABEL,
    PROPAGATE_DELETION_ANNOTATION,
};
use canopy_core::retry::{retry_transient, RetryPolicy};
use canopy_core::store::{ListOptions, Store, StoreObject};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// What a failed propagation step was working on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagatedKind {
    Namespace,
    Secret,
    RoleBinding,
}

impl fmt::Display for PropagatedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PropagatedKind::Namespace => "Namespace",
            PropagatedKind::Secret => "Secret",
            PropagatedKind::RoleBinding => "RoleBinding",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} propagation into namespace {namespace} failed: {source}")]
pub struct PropagationError {
    pub kind: PropagatedKind,
    pub namespace: String,
    #[source]
    pub source: Error,
}

impl PropagationError {
    fn new(kind: PropagatedKind, namespace: &str, source: Error) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            source,
        }
    }
}

pub type PropagationResult<T> = std::result::Result<T, PropagationError>;

/// What a propagation pass needs to know about the tenant pair
#[derive(Debug, Clone, Copy)]
pub struct PropagationRequest<'a> {
    pub parent: &'a str,
    pub child: &'a str,
    pub secret_names: &'a [String],
    /// Annotation that opts a parent role binding into propagation
    pub annotation_filter: &'a str,
}

/// Outcome of a successful propagation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub secrets: Vec<String>,
    pub role_bindings: Vec<String>,
    pub deleted: Vec<String>,
}

/// Objects that can be mirrored into a child namespace
trait Propagated: StoreObject {
    const KIND: PropagatedKind;

    /// True when `self` already carries everything `desired` would write
    fn matches(&self, desired: &Self) -> bool;

    /// Overwrite the propagated fields of `self` with those of `desired`
    fn overwrite(&mut self, desired: &Self);

    /// True when `self` cannot be updated in place to match `desired`
    fn needs_recreate(&self, _desired: &Self) -> bool {
        false
    }
}

impl Propagated for Secret {
    const KIND: PropagatedKind = PropagatedKind::Secret;

    fn matches(&self, desired: &Self) -> bool {
        self.metadata.labels == desired.metadata.labels
            && self.metadata.annotations == desired.metadata.annotations
            && self.data == desired.data
            && self.string_data == desired.string_data
            && self.type_ == desired.type_
            && self.immutable == desired.immutable
    }

    fn overwrite(&mut self, desired: &Self) {
        self.metadata.labels = desired.metadata.labels.clone();
        self.metadata.annotations = desired.metadata.annotations.clone();
        self.data = desired.data.clone();
        self.string_data = desired.string_data.clone();
        self.type_ = desired.type_.clone();
        self.immutable = desired.immutable;
    }

    fn needs_recreate(&self, desired: &Self) -> bool {
        self.immutable == Some(true)
            && (self.data != desired.data
                || self.string_data != desired.string_data
                || self.type_ != desired.type_
                || self.immutable != desired.immutable)
    }
}

impl Propagated for RoleBinding {
    const KIND: PropagatedKind = PropagatedKind::RoleBinding;

    fn matches(&self, desired: &Self) -> bool {
        self.metadata.labels == desired.metadata.labels
            && self.metadata.annotations == desired.metadata.annotations
            && self.subjects == desired.subjects
            && self.role_ref == desired.role_ref
    }

    fn overwrite(&mut self, desired: &Self) {
        self.metadata.labels = desired.metadata.labels.clone();
        self.metadata.annotations = desired.metadata.annotations.clone();
        self.subjects = desired.subjects.clone();
        self.role_ref = desired.role_ref.clone();
    }
}

/// Metadata of a copy: bookkeeping keys stripped, origin stamped
fn propagated_meta(source: &ObjectMeta, parent: &str) -> ObjectMeta {
    let mut labels = strip_package_manager_keys(source.labels.as_ref()).unwrap_or_default();
    labels.insert(PROPAGATED_FROM_LABEL.to_string(), parent.to_string());
    ObjectMeta {
        name: source.name.clone(),
        labels: Some(labels),
        annotations: strip_package_manager_keys(source.annotations.as_ref())
            .filter(|a| !a.is_empty()),
        ..Default::default()
    }
}

fn propagated_secret(source: &Secret, parent: &str) -> Secret {
    Secret {
        metadata: propagated_meta(&source.metadata, parent),
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        type_: source.type_.clone(),
        immutable: source.immutable,
    }
}

fn propagated_role_binding(source: &RoleBinding, parent: &str) -> RoleBinding {
    RoleBinding {
        metadata: propagated_meta(&source.metadata, parent),
        subjects: source.subjects.clone(),
        role_ref: source.role_ref.clone(),
    }
}

/// Everything a pass writes, computed from reads only
struct Plan {
    secrets: Vec<Secret>,
    role_bindings: Vec<RoleBinding>,
    existing_secrets: BTreeMap<String, Secret>,
    existing_role_bindings: BTreeMap<String, RoleBinding>,
}

/// Propagation engine over a [`Store`]
#[derive(Clone)]
pub struct Propagator<S: Store> {
    store: S,
    retry: RetryPolicy,
}

impl<S: Store> Propagator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create `name` if absent, otherwise merge `labels` and `annotations`
    /// into it. Other fields and other keys are left alone.
    #[instrument(skip(self, labels, annotations, deadline))]
    pub async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        deadline: Deadline,
    ) -> PropagationResult<Namespace> {
        let attempt = || async {
            match self.store.get_opt::<Namespace>("", name).await? {
                None => {
                    let namespace = Namespace {
                        metadata: ObjectMeta {
                            name: Some(name.to_string()),
                            labels: Some(labels.clone()),
                            annotations: Some(annotations.clone()).filter(|a| !a.is_empty()),
                            ..Default::default()
                        },
                        ..Default::default()
                    };
                    match self.store.create("", &namespace).await {
                        Ok(created) => {
                            info!(namespace = %name, "Created namespace");
                            Ok(created)
                        }
                        // Lost a race with another writer; re-read and merge
                        Err(Error::AlreadyExists { .. }) => Err(Error::Conflict(format!(
                            "namespace {name} was created concurrently"
                        ))),
                        Err(e) => Err(e),
                    }
                }
                Some(existing)
                    if contains_all(existing.metadata.labels.as_ref(), labels)
                        && contains_all(existing.metadata.annotations.as_ref(), annotations) =>
                {
                    Ok(existing)
                }
                Some(mut existing) => {
                    merge_into(&mut existing.metadata.labels, labels);
                    if !annotations.is_empty() {
                        merge_into(&mut existing.metadata.annotations, annotations);
                    }
                    debug!(namespace = %name, "Merging namespace labels");
                    self.store.replace("", &existing).await
                }
            }
        };

        retry_transient(deadline, &self.retry, "ensure namespace", attempt)
            .await
            .map_err(|e| PropagationError::new(PropagatedKind::Namespace, name, e))
    }

    /// Mirror the named secrets and the opted-in role bindings of
    /// `request.parent` into `request.child`, then delete copies that are no
    /// longer eligible.
    #[instrument(skip(self, request, deadline), fields(parent = %request.parent, child = %request.child))]
    pub async fn propagate(
        &self,
        request: &PropagationRequest<'_>,
        deadline: Deadline,
    ) -> PropagationResult<PropagationReport> {
        let plan = self.plan(request).await?;

        let mut report = PropagationReport::default();
        for secret in &plan.secrets {
            self.upsert(request.child, secret, plan.existing_secrets.get(&secret.name_any()), deadline)
                .await?;
            report.secrets.push(secret.name_any());
        }
        for binding in &plan.role_bindings {
            self.upsert(
                request.child,
                binding,
                plan.existing_role_bindings.get(&binding.name_any()),
                deadline,
            )
            .await?;
            report.role_bindings.push(binding.name_any());
        }

        let secret_orphans = orphans(&plan.existing_secrets, &report.secrets);
        let binding_orphans = orphans(&plan.existing_role_bindings, &report.role_bindings);
        let failed_secrets = self
            .delete_all::<Secret>(request.child, &secret_orphans, &mut report.deleted)
            .await;
        let failed_bindings = self
            .delete_all::<RoleBinding>(request.child, &binding_orphans, &mut report.deleted)
            .await;

        let failed_kind = if !failed_secrets.is_empty() {
            Some(PropagatedKind::Secret)
        } else if !failed_bindings.is_empty() {
            Some(PropagatedKind::RoleBinding)
        } else {
            None
        };
        if let Some(kind) = failed_kind {
            let names = failed_secrets.into_iter().chain(failed_bindings).collect();
            return Err(PropagationError::new(
                kind,
                request.child,
                Error::CleanupIncomplete {
                    namespace: request.child.to_string(),
                    names,
                },
            ));
        }

        info!(
            secrets = report.secrets.len(),
            role_bindings = report.role_bindings.len(),
            deleted = report.deleted.len(),
            "Propagation complete"
        );
        Ok(report)
    }

    async fn plan(&self, request: &PropagationRequest<'_>) -> PropagationResult<Plan> {
        let secret_err = |e: Error| PropagationError::new(PropagatedKind::Secret, request.child, e);
        let binding_err =
            |e: Error| PropagationError::new(PropagatedKind::RoleBinding, request.child, e);

        let mut secrets = Vec::with_capacity(request.secret_names.len());
        for name in request.secret_names {
            let source: Secret = self
                .store
                .get(request.parent, name)
                .await
                .map_err(|e| match e {
                    Error::NotFound { .. } => Error::not_found("Secret", request.parent, name),
                    other => other,
                })
                .map_err(secret_err)?;
            secrets.push(propagated_secret(&source, request.parent));
        }

        let role_bindings = self
            .store
            .list::<RoleBinding>(request.parent, &ListOptions::default())
            .await
            .map_err(binding_err)?
            .items
            .iter()
            .filter(|b| {
                b.annotations().get(request.annotation_filter).map(String::as_str) == Some("true")
            })
            .map(|b| propagated_role_binding(b, request.parent))
            .collect();

        let copies = ListOptions::labels(selector(&[(PROPAGATED_FROM_LABEL, request.parent)]));
        let existing_secrets = self
            .store
            .list::<Secret>(request.child, &copies)
            .await
            .map_err(secret_err)?
            .items
            .into_iter()
            .map(|s| (s.name_any(), s))
            .collect();
        let existing_role_bindings = self
            .store
            .list::<RoleBinding>(request.child, &copies)
            .await
            .map_err(binding_err)?
            .items
            .into_iter()
            .map(|b| (b.name_any(), b))
            .collect();

        Ok(Plan {
            secrets,
            role_bindings,
            existing_secrets,
            existing_role_bindings,
        })
    }

    /// Create `desired` in `namespace`, or bring the existing object in line
    async fn upsert<K: Propagated>(
        &self,
        namespace: &str,
        desired: &K,
        known: Option<&K>,
        deadline: Deadline,
    ) -> PropagationResult<()> {
        let name = desired.name_any();
        let mut current = known.cloned();

        let attempt = || {
            let snapshot = current.take();
            let name = name.as_str();
            async move {
                let existing = match snapshot {
                    Some(existing) => Some(existing),
                    None => self.store.get_opt::<K>(namespace, &name).await?,
                };
                match existing {
                    Some(existing) if existing.matches(desired) => Ok(()),
                    Some(existing) if existing.needs_recreate(desired) => {
                        match self.store.delete::<K>(namespace, &name).await {
                            Ok(()) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                        info!(kind = %K::KIND, name = %name, namespace = %namespace, uid = ?existing.uid(), "Replacing immutable propagated object");
                        self.create_copy(namespace, desired).await
                    }
                    Some(mut existing) => {
                        existing.overwrite(desired);
                        self.store.replace(namespace, &existing).await?;
                        debug!(kind = %K::KIND, name = %name, namespace = %namespace, "Updated propagated object");
                        Ok(())
                    }
                    None => self.create_copy(namespace, desired).await,
                }
            }
        };

        retry_transient(deadline, &self.retry, "propagate object", attempt)
            .await
            .map_err(|e| PropagationError::new(K::KIND, namespace, e))
    }

    async fn create_copy<K: Propagated>(
        &self,
        namespace: &str,
        desired: &K,
    ) -> canopy_core::error::Result<()> {
        let name = desired.name_any();
        match self.store.create(namespace, desired).await {
            Ok(_) => {
                debug!(kind = %K::KIND, name = %name, namespace = %namespace, "Created propagated object");
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => Err(Error::Conflict(format!(
                "{} {name} was created concurrently",
                K::KIND
            ))),
            Err(e) => Err(e),
        }
    }

    /// Delete every name, recording successes in `deleted`; returns the
    /// names that could not be deleted
    async fn delete_all<K: Propagated>(
        &self,
        namespace: &str,
        names: &[String],
        deleted: &mut Vec<String>,
    ) -> Vec<String> {
        let mut failed = Vec::new();
        for name in names {
            match self.store.delete::<K>(namespace, name).await {
                Ok(()) => {
                    info!(kind = %K::KIND, name = %name, namespace = %namespace, "Deleted orphaned propagated object");
                    deleted.push(name.clone());
                }
                Err(e) if e.is_not_found() => deleted.push(name.clone()),
                Err(e) => {
                    warn!(kind = %K::KIND, name = %name, namespace = %namespace, error = %e, "Failed to delete orphaned propagated object");
                    failed.push(name.clone());
                }
            }
        }
        failed
    }
}

/// Copies that are no longer eligible and did not opt out of deletion
fn orphans<K: StoreObject>(existing: &BTreeMap<String, K>, eligible: &[String]) -> Vec<String> {
    let eligible: BTreeSet<&str> = eligible.iter().map(String::as_str).collect();
    existing
        .iter()
        .filter(|(name, _)| !eligible.contains(name.as_str()))
        .filter(|(_, obj)| {
            obj.annotations().get(PROPAGATE_DELETION_ANNOTATION).map(String::as_str) != Some("false")
        })
        .map(|(name, _)| name.clone())
        .collect()
}
