//! Kubernetes-backed store

use super::{ListOptions, ObjectList, Store, StoreEvent, StoreFactory, StoreObject};
use crate::error::{Error, Result};
use crate::identity::Identity;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::core::WatchEvent;
use kube::{Client, Config, ResourceExt};
use serde_json::json;
use tracing::debug;

/// Server-side watch timeout; the awaiter re-establishes ended watches
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Store over a `kube::Client`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Fill in kind/namespace/name on errors derived from a bare API status
fn scoped<K: StoreObject>(err: kube::Error, namespace: &str, name: &str) -> Error {
    match Error::from(err) {
        Error::NotFound { .. } => Error::not_found(&K::kind_name(), namespace, name),
        Error::AlreadyExists { .. } => Error::already_exists(&K::kind_name(), namespace, name),
        other => other,
    }
}

fn list_params(options: &ListOptions) -> ListParams {
    let mut params = ListParams::default();
    if let Some(labels) = &options.label_selector {
        params = params.labels(labels);
    }
    if let Some(fields) = &options.field_selector {
        params = params.fields(fields);
    }
    params
}

fn watch_params(options: &ListOptions) -> WatchParams {
    let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(labels) = &options.label_selector {
        params = params.labels(labels);
    }
    if let Some(fields) = &options.field_selector {
        params = params.fields(fields);
    }
    params
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K> {
        K::api(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(|e| scoped::<K>(e, namespace, name))
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        options: &ListOptions,
    ) -> Result<ObjectList<K>> {
        let list = K::api(self.client.clone(), namespace)
            .list(&list_params(options))
            .await?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch<K: StoreObject>(
        &self,
        namespace: &str,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<StoreEvent<K>>>> {
        debug!(
            kind = %K::kind_name(),
            namespace = %namespace,
            resource_version = %resource_version,
            "Opening watch"
        );
        let stream = K::api(self.client.clone(), namespace)
            .watch(&watch_params(options), resource_version)
            .await?;

        Ok(stream
            .map_err(Error::from)
            .try_filter_map(|event| async move {
                Ok(match event {
                    WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                        Some(StoreEvent::Applied(obj))
                    }
                    WatchEvent::Deleted(obj) => Some(StoreEvent::Deleted(obj)),
                    WatchEvent::Bookmark(_) => None,
                    WatchEvent::Error(e) if e.code == 410 => Some(StoreEvent::Expired),
                    WatchEvent::Error(e) => return Err(Error::from(kube::Error::Api(e))),
                })
            })
            .boxed())
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        K::api(self.client.clone(), namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| scoped::<K>(e, namespace, &obj.name_any()))
    }

    async fn replace<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        K::api(self.client.clone(), namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| scoped::<K>(e, namespace, &name))
    }

    async fn replace_status<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let value = serde_json::to_value(obj)?;
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        K::api(self.client.clone(), namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| scoped::<K>(e, namespace, &name))
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| scoped::<K>(e, namespace, name))
    }
}

/// Builds impersonating clients from the operator's own configuration
#[derive(Clone)]
pub struct KubeStoreFactory {
    config: Config,
    privileged: KubeStore,
}

impl KubeStoreFactory {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::try_from(config.clone())
            .map_err(|e| Error::Internal(format!("failed to build store client: {e}")))?;
        Ok(Self {
            config,
            privileged: KubeStore::new(client),
        })
    }

    /// Factory over the in-cluster or kubeconfig configuration
    pub async fn infer() -> Result<Self> {
        let config = Config::infer()
            .await
            .map_err(|e| Error::Internal(format!("failed to load cluster configuration: {e}")))?;
        Self::new(config)
    }
}

impl StoreFactory for KubeStoreFactory {
    type Store = KubeStore;

    fn for_identity(&self, identity: &Identity) -> Result<KubeStore> {
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(identity.name.clone());
        if !identity.groups.is_empty() {
            config.auth_info.impersonate_groups = Some(identity.groups.clone());
        }
        let client = Client::try_from(config).map_err(|e| {
            Error::Internal(format!("failed to build client for {identity}: {e}"))
        })?;
        Ok(KubeStore::new(client))
    }

    fn privileged(&self) -> KubeStore {
        self.privileged.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;

    #[test]
    fn test_scoped_not_found_names_kind() {
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "secrets \"creds\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        let err = scoped::<Secret>(err, "org-1", "creds");
        assert_eq!(
            err.to_string(),
            "Secret not found: creds in namespace org-1"
        );
    }

    #[test]
    fn test_list_params_carry_selectors() {
        let params = list_params(&ListOptions {
            label_selector: Some("a=b".to_string()),
            field_selector: Some("metadata.name=x".to_string()),
        });
        assert_eq!(params.label_selector.as_deref(), Some("a=b"));
        assert_eq!(params.field_selector.as_deref(), Some("metadata.name=x"));
    }
}
