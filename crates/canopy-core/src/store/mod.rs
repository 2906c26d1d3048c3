//! Declarative store adapter
//!
//! Typed get/list/watch/create/replace/replace-status/delete against versioned
//! resource objects, scoped by namespace and by caller identity.
//!
//! Two implementations share the same semantics:
//!
//! - [`KubeStore`] talks to a Kubernetes API server through `kube::Api`,
//!   impersonating the caller's identity.
//! - [`MemoryStore`] keeps objects in process and is used as the test double
//!   by the controllers and repositories.
//!
//! Every object carries a resource version. `replace` and `replace_status`
//! are optimistic: a stale resource version is rejected with
//! [`Error::Conflict`](crate::Error::Conflict) and retrying is the caller's
//! responsibility.

mod kube_store;
mod memory;

pub use kube_store::{KubeStore, KubeStoreFactory};
pub use memory::{InjectedError, MemoryStore, Verb};

use crate::crd::{
    AppWorkload, BuildWorkload, CanopyApp, CanopyBuild, CanopyOrg, CanopyPackage,
    CanopyServiceBinding, CanopyServiceInstance, CanopySpace, CanopyTask, TaskWorkload,
};
use crate::error::{Error, Result};
use crate::identity::Identity;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// A resource type the store knows how to address
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Cluster-scoped kinds ignore the namespace argument
    const NAMESPACED: bool;

    /// Typed API handle; an empty namespace addresses all namespaces
    fn api(client: Client, namespace: &str) -> Api<Self>;

    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }
}

macro_rules! namespaced_objects {
    ($($kind:ty),* $(,)?) => {
        $(
            impl StoreObject for $kind {
                const NAMESPACED: bool = true;

                fn api(client: Client, namespace: &str) -> Api<Self> {
                    if namespace.is_empty() {
                        Api::all(client)
                    } else {
                        Api::namespaced(client, namespace)
                    }
                }
            }
        )*
    };
}

namespaced_objects!(
    Secret,
    RoleBinding,
    CanopyOrg,
    CanopySpace,
    CanopyApp,
    AppWorkload,
    CanopyPackage,
    CanopyBuild,
    BuildWorkload,
    CanopyTask,
    TaskWorkload,
    CanopyServiceInstance,
    CanopyServiceBinding,
);

impl StoreObject for Namespace {
    const NAMESPACED: bool = false;

    fn api(client: Client, _namespace: &str) -> Api<Self> {
        Api::all(client)
    }
}

/// Label and field selectors for list and watch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// e.g. `canopy.io/app-guid=abc,tier!=db`
    pub label_selector: Option<String>,
    /// Only `metadata.name` and `metadata.namespace` are supported
    pub field_selector: Option<String>,
}

impl ListOptions {
    pub fn labels(selector: impl Into<String>) -> Self {
        Self {
            label_selector: Some(selector.into()),
            field_selector: None,
        }
    }

    pub fn fields(selector: impl Into<String>) -> Self {
        Self {
            label_selector: None,
            field_selector: Some(selector.into()),
        }
    }
}

/// A consistent list snapshot
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    /// Version to start a watch from without missing changes
    pub resource_version: String,
}

/// A change notification from a watch
#[derive(Debug, Clone)]
pub enum StoreEvent<K> {
    /// Object added or modified; carries the full new state
    Applied(K),
    /// Object removed; carries its last known state
    Deleted(K),
    /// The watch origin is too old; re-list and watch again
    Expired,
}

/// Typed operations against the declarative store
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K>;

    async fn list<K: StoreObject>(&self, namespace: &str, options: &ListOptions)
        -> Result<ObjectList<K>>;

    /// Stream changes after `resource_version`
    async fn watch<K: StoreObject>(
        &self,
        namespace: &str,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<StoreEvent<K>>>>;

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace metadata and spec, guarded by the object's resource version
    async fn replace<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace only the status subresource, guarded by the resource version
    async fn replace_status<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()>;

    /// `get` that maps `NotFound` to `None`
    async fn get_opt<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.get::<K>(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Hands out stores acting on behalf of a caller
pub trait StoreFactory: Clone + Send + Sync + 'static {
    type Store: Store;

    /// A store whose every call is authorized as `identity`
    fn for_identity(&self, identity: &Identity) -> Result<Self::Store>;

    /// A store acting as the platform itself
    fn privileged(&self) -> Self::Store;
}

/// Controller owner reference pointing at `owner`
pub fn owner_reference<O: StoreObject>(owner: &O) -> Result<OwnerReference> {
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidState(format!(
            "{} {} has no uid and cannot own other objects",
            O::kind_name(),
            owner.name_any()
        ))
    })
}

/// Add a controller owner reference to `obj` unless one is already present
pub fn set_owner<O: StoreObject, K: Resource>(owner: &O, obj: &mut K) -> Result<()> {
    let reference = owner_reference(owner)?;
    let refs = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if !refs.iter().any(|r| r.uid == reference.uid) {
        refs.push(reference);
    }
    Ok(())
}

/// True when `obj` lists `owner` among its owners
pub fn is_owned_by<O: Resource, K: Resource>(obj: &K, owner: &O) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    obj.meta()
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}
