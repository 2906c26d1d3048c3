//! Service bindings between an app and a service instance

use super::namespace_retriever::NamespaceRetriever;
use super::{created_at, for_resource, new_guid, updated_at};
use crate::awaiter::{Awaited, ConditionAwaiter};
use canopy_core::conditions::{is_condition_true, Conditioned, READY};
use canopy_core::crd::{CanopyApp, CanopyServiceBinding, CanopyServiceBindingSpec, NamedRef};
use canopy_core::error::Result;
use canopy_core::identity::RequestContext;
use canopy_core::labels::APP_GUID_LABEL;
use canopy_core::store::{Store, StoreFactory};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{info, instrument};

pub const SERVICE_BINDING_RESOURCE: &str = "ServiceBinding";
const APP_RESOURCE: &str = "App";

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceBindingRecord {
    pub guid: String,
    pub name: Option<String>,
    pub app_guid: String,
    pub service_instance_guid: String,
    pub space_guid: String,
    /// Secret exposing the credentials, once resolved
    pub binding_secret: Option<String>,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&CanopyServiceBinding> for ServiceBindingRecord {
    fn from(binding: &CanopyServiceBinding) -> Self {
        Self {
            guid: binding.name_any(),
            name: binding.spec.display_name.clone(),
            app_guid: binding.spec.app_ref.name.clone(),
            service_instance_guid: binding.spec.service.name.clone(),
            space_guid: binding.namespace().unwrap_or_default(),
            binding_secret: binding
                .status
                .as_ref()
                .and_then(|s| s.binding.as_ref())
                .map(|b| b.name.clone()),
            ready: is_condition_true(binding.conditions(), READY),
            labels: binding.labels().clone(),
            annotations: binding.annotations().clone(),
            created_at: created_at(binding),
            updated_at: updated_at(binding),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateServiceBindingMessage {
    pub name: Option<String>,
    pub app_guid: String,
    pub service_instance_guid: String,
}

#[derive(Clone)]
pub struct ServiceBindingRepo<F> {
    factory: F,
    namespaces: NamespaceRetriever<F>,
}

impl<F: StoreFactory> ServiceBindingRepo<F> {
    pub fn new(factory: F) -> Self {
        Self {
            namespaces: NamespaceRetriever::new(factory.clone()),
            factory,
        }
    }

    /// Bind an instance to an app and wait until the credentials resolve
    #[instrument(skip(self, ctx, message), fields(user = %ctx.identity, app = %message.app_guid, instance = %message.service_instance_guid))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        message: CreateServiceBindingMessage,
    ) -> Result<ServiceBindingRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyApp>(&message.app_guid, APP_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let guid = new_guid();
        let mut binding = CanopyServiceBinding::new(
            &guid,
            CanopyServiceBindingSpec {
                display_name: message.name,
                service: NamedRef::new(message.service_instance_guid),
                app_ref: NamedRef::new(&message.app_guid),
            },
        );
        binding
            .labels_mut()
            .insert(APP_GUID_LABEL.to_string(), message.app_guid);

        let created = store.create(&namespace, &binding).await?;
        info!(guid = %guid, namespace = %namespace, "Created service binding, waiting for it to become ready");

        let ready = ConditionAwaiter::new(store)
            .await_after_write(ctx.deadline, &namespace, created, Awaited::is_true(READY))
            .await
            .map_err(|e| for_resource(e, SERVICE_BINDING_RESOURCE))?;
        Ok(ServiceBindingRecord::from(&ready))
    }

    pub async fn get(&self, ctx: &RequestContext, guid: &str) -> Result<ServiceBindingRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyServiceBinding>(guid, SERVICE_BINDING_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        let binding: CanopyServiceBinding = store
            .get(&namespace, guid)
            .await
            .map_err(|e| for_resource(e, SERVICE_BINDING_RESOURCE))?;
        Ok(ServiceBindingRecord::from(&binding))
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.identity))]
    pub async fn delete(&self, ctx: &RequestContext, guid: &str) -> Result<()> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyServiceBinding>(guid, SERVICE_BINDING_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        store
            .delete::<CanopyServiceBinding>(&namespace, guid)
            .await
            .map_err(|e| for_resource(e, SERVICE_BINDING_RESOURCE))?;
        info!(guid = %guid, "Deleted service binding");
        Ok(())
    }
}
