//! Builds: `CanopyBuild` objects staging a package into a droplet

use super::namespace_retriever::NamespaceRetriever;
use super::{created_at, for_resource, new_guid, updated_at};
use canopy_core::conditions::{find_condition, Conditioned};
use canopy_core::crd::{
    CanopyBuild, CanopyBuildSpec, CanopyPackage, DropletStatus, Lifecycle, NamedRef,
    BUILD_SUCCEEDED,
};
use canopy_core::error::{Error, Result};
use canopy_core::identity::RequestContext;
use canopy_core::labels::{selector, APP_GUID_LABEL};
use canopy_core::state::build::{build_state, BuildState};
use canopy_core::store::{ListOptions, Store, StoreFactory};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{info, instrument};

pub const BUILD_RESOURCE: &str = "Build";
const PACKAGE_RESOURCE: &str = "Package";

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecord {
    pub guid: String,
    pub app_guid: String,
    pub package_guid: String,
    pub state: BuildState,
    /// Message of a failed build
    pub staging_error: Option<String>,
    pub staging_memory_mb: i64,
    pub staging_disk_mb: i64,
    pub lifecycle: Lifecycle,
    pub droplet: Option<DropletStatus>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&CanopyBuild> for BuildRecord {
    fn from(build: &CanopyBuild) -> Self {
        let state = build_state(build);
        let staging_error = (state == BuildState::Failed)
            .then(|| find_condition(build.conditions(), BUILD_SUCCEEDED))
            .flatten()
            .map(|c| c.message.clone());
        Self {
            guid: build.name_any(),
            app_guid: build.spec.app_ref.name.clone(),
            package_guid: build.spec.package_ref.name.clone(),
            state,
            staging_error,
            staging_memory_mb: build.spec.staging_memory_mb,
            staging_disk_mb: build.spec.staging_disk_mb,
            lifecycle: build.spec.lifecycle.clone(),
            droplet: build.status.as_ref().and_then(|s| s.droplet.clone()),
            labels: build.labels().clone(),
            annotations: build.annotations().clone(),
            created_at: created_at(build),
            updated_at: updated_at(build),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateBuildMessage {
    pub package_guid: String,
    pub staging_memory_mb: i64,
    pub staging_disk_mb: i64,
    /// Empty falls back to the app's lifecycle
    pub lifecycle: Lifecycle,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct BuildRepo<F> {
    factory: F,
    namespaces: NamespaceRetriever<F>,
}

impl<F: StoreFactory> BuildRepo<F> {
    pub fn new(factory: F) -> Self {
        Self {
            namespaces: NamespaceRetriever::new(factory.clone()),
            factory,
        }
    }

    /// Start staging a package; the returned build is `STAGING`
    #[instrument(skip(self, ctx, message), fields(user = %ctx.identity, package = %message.package_guid))]
    pub async fn create(&self, ctx: &RequestContext, message: CreateBuildMessage) -> Result<BuildRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyPackage>(&message.package_guid, PACKAGE_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        let package: CanopyPackage = store
            .get(&namespace, &message.package_guid)
            .await
            .map_err(|e| for_resource(e, PACKAGE_RESOURCE))?;
        let app_guid = package.spec.app_ref.name.clone();

        let guid = new_guid();
        let mut build = CanopyBuild::new(
            &guid,
            CanopyBuildSpec {
                package_ref: NamedRef::new(message.package_guid),
                app_ref: NamedRef::new(&app_guid),
                staging_memory_mb: message.staging_memory_mb,
                staging_disk_mb: message.staging_disk_mb,
                lifecycle: message.lifecycle,
            },
        );
        let mut labels = message.labels;
        labels.insert(APP_GUID_LABEL.to_string(), app_guid);
        build.metadata.labels = Some(labels);
        build.metadata.annotations = Some(message.annotations);

        let created = store.create(&namespace, &build).await?;
        info!(guid = %guid, namespace = %namespace, "Created build");
        Ok(BuildRecord::from(&created))
    }

    pub async fn get(&self, ctx: &RequestContext, guid: &str) -> Result<BuildRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyBuild>(guid, BUILD_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        let build: CanopyBuild = store
            .get(&namespace, guid)
            .await
            .map_err(|e| for_resource(e, BUILD_RESOURCE))?;
        Ok(BuildRecord::from(&build))
    }

    /// Most recently created build of an app
    pub async fn latest_for_app(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        app_guid: &str,
    ) -> Result<BuildRecord> {
        let store = self.factory.for_identity(&ctx.identity)?;
        let builds = store
            .list::<CanopyBuild>(namespace, &ListOptions::labels(selector(&[(APP_GUID_LABEL, app_guid)])))
            .await?
            .items;
        builds
            .iter()
            .max_by(|a, b| {
                a.creation_timestamp()
                    .cmp(&b.creation_timestamp())
                    .then_with(|| a.name_any().cmp(&b.name_any()))
            })
            .map(BuildRecord::from)
            .ok_or_else(|| Error::not_found(BUILD_RESOURCE, namespace, app_guid))
    }
}
