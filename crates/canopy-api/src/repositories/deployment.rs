//! Deployments: rolling an app to a new revision of a droplet
//!
//! A deployment is not an object of its own. Its GUID is the app's, and its
//! status is derived from the app's `Ready` condition and the revision the
//! app's workload reports.

use super::namespace_retriever::NamespaceRetriever;
use super::{created_at, for_resource, updated_at};
use canopy_core::crd::CanopyApp;
use canopy_core::error::Result;
use canopy_core::identity::RequestContext;
use canopy_core::retry::{retry_transient, RetryPolicy};
use canopy_core::state::deployment::{
    bump_revision, deployment_status, revision_of, DeploymentStatusReason, DeploymentStatusValue,
};
use canopy_core::store::{Store, StoreFactory};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{info, instrument};

pub const DEPLOYMENT_RESOURCE: &str = "Deployment";

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRecord {
    pub guid: String,
    pub droplet_guid: Option<String>,
    pub revision: u64,
    pub status_value: DeploymentStatusValue,
    pub status_reason: DeploymentStatusReason,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    fn from_app(app: &CanopyApp) -> Result<Self> {
        let (status_value, status_reason) = deployment_status(app);
        Ok(Self {
            guid: app.name_any(),
            droplet_guid: app.current_droplet().map(str::to_string),
            revision: revision_of(app)?,
            status_value,
            status_reason,
            created_at: created_at(app),
            updated_at: updated_at(app),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateDeploymentMessage {
    pub app_guid: String,
    /// Deploy this droplet instead of the app's current one
    pub droplet_guid: Option<String>,
}

#[derive(Clone)]
pub struct DeploymentRepo<F> {
    factory: F,
    namespaces: NamespaceRetriever<F>,
    retry: RetryPolicy,
}

impl<F: StoreFactory> DeploymentRepo<F> {
    pub fn new(factory: F) -> Self {
        Self {
            namespaces: NamespaceRetriever::new(factory.clone()),
            factory,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn get(&self, ctx: &RequestContext, guid: &str) -> Result<DeploymentRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyApp>(guid, DEPLOYMENT_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        let app: CanopyApp = store
            .get(&namespace, guid)
            .await
            .map_err(|e| for_resource(e, DEPLOYMENT_RESOURCE))?;
        DeploymentRecord::from_app(&app)
    }

    /// Bump the app's revision and start it on the chosen droplet
    ///
    /// The bump is written as one guarded replace; a conflicting writer makes
    /// it start over from a fresh read until the request deadline.
    #[instrument(skip(self, ctx, message), fields(user = %ctx.identity, app = %message.app_guid))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        message: &CreateDeploymentMessage,
    ) -> Result<DeploymentRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyApp>(&message.app_guid, DEPLOYMENT_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let app = retry_transient(ctx.deadline, &self.retry, "create deployment", || async {
            let app: CanopyApp = store.get(&namespace, &message.app_guid).await?;
            let bumped = bump_revision(&app, message.droplet_guid.as_deref())?;
            store.replace(&namespace, &bumped).await
        })
        .await
        .map_err(|e| for_resource(e, DEPLOYMENT_RESOURCE))?;

        let record = DeploymentRecord::from_app(&app)?;
        info!(revision = record.revision, droplet = ?record.droplet_guid, "Started deployment");
        Ok(record)
    }
}
