//! GUID to namespace lookup
//!
//! API paths carry only an object's GUID. The namespace is found with a
//! cluster-wide privileged list on `metadata.name`; authorization happens on
//! the caller's own store afterwards.

use canopy_core::error::{Error, Result};
use canopy_core::store::{ListOptions, Store, StoreFactory, StoreObject};
use kube::ResourceExt;
use tracing::debug;

#[derive(Clone)]
pub struct NamespaceRetriever<F> {
    factory: F,
}

impl<F: StoreFactory> NamespaceRetriever<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    /// Namespace of the `K` named `guid`
    ///
    /// No match is `NotFound` under `resource`; more than one is
    /// `InvalidState`, as GUIDs are unique across namespaces.
    pub async fn namespace_for<K: StoreObject>(&self, guid: &str, resource: &str) -> Result<String> {
        let options = ListOptions::fields(format!("metadata.name={guid}"));
        let list = self.factory.privileged().list::<K>("", &options).await?;

        match list.items.as_slice() {
            [] => Err(Error::not_found(resource, "", guid)),
            [found] => {
                let namespace = found.namespace().ok_or_else(|| {
                    Error::InvalidState(format!("{resource} {guid} has no namespace"))
                })?;
                debug!(resource = %resource, guid = %guid, namespace = %namespace, "Resolved namespace");
                Ok(namespace)
            }
            many => Err(Error::InvalidState(format!(
                "get-{resource}-namespace duplicate records exist: found {} {resource} objects named {guid}",
                many.len()
            ))),
        }
    }
}
