//! Apps and their current droplet

use super::namespace_retriever::NamespaceRetriever;
use super::{created_at, for_resource, updated_at};
use canopy_core::conditions::{is_condition_true, Conditioned, READY};
use canopy_core::crd::{CanopyApp, CanopyBuild, DesiredState, Lifecycle, NamedRef};
use canopy_core::error::{Error, Result};
use canopy_core::identity::RequestContext;
use canopy_core::retry::{retry_transient, RetryPolicy};
use canopy_core::state::build::{build_state, BuildState};
use canopy_core::store::{Store, StoreFactory};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{info, instrument};

pub const APP_RESOURCE: &str = "App";
const DROPLET_RESOURCE: &str = "Droplet";

#[derive(Debug, Clone, PartialEq)]
pub struct AppRecord {
    pub guid: String,
    pub name: String,
    pub space_guid: String,
    pub state: DesiredState,
    pub droplet_guid: Option<String>,
    /// Raw revision annotation
    pub revision: Option<String>,
    pub ready: bool,
    pub lifecycle: Lifecycle,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&CanopyApp> for AppRecord {
    fn from(app: &CanopyApp) -> Self {
        Self {
            guid: app.name_any(),
            name: app.spec.display_name.clone(),
            space_guid: app.namespace().unwrap_or_default(),
            state: app.spec.desired_state,
            droplet_guid: app.current_droplet().map(str::to_string),
            revision: app.revision().map(str::to_string),
            ready: is_condition_true(app.conditions(), READY),
            lifecycle: app.spec.lifecycle.clone(),
            labels: app.labels().clone(),
            annotations: app.annotations().clone(),
            created_at: created_at(app),
            updated_at: updated_at(app),
        }
    }
}

#[derive(Clone)]
pub struct AppRepo<F> {
    factory: F,
    namespaces: NamespaceRetriever<F>,
    retry: RetryPolicy,
}

impl<F: StoreFactory> AppRepo<F> {
    pub fn new(factory: F) -> Self {
        Self {
            namespaces: NamespaceRetriever::new(factory.clone()),
            factory,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn get(&self, ctx: &RequestContext, guid: &str) -> Result<AppRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyApp>(guid, APP_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        let app: CanopyApp = store
            .get(&namespace, guid)
            .await
            .map_err(|e| for_resource(e, APP_RESOURCE))?;
        Ok(AppRecord::from(&app))
    }

    /// Point the app at the droplet of one of its staged builds
    #[instrument(skip(self, ctx), fields(user = %ctx.identity))]
    pub async fn set_current_droplet(
        &self,
        ctx: &RequestContext,
        app_guid: &str,
        droplet_guid: &str,
    ) -> Result<AppRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyApp>(app_guid, APP_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let build: CanopyBuild = store
            .get(&namespace, droplet_guid)
            .await
            .map_err(|e| for_resource(e, DROPLET_RESOURCE))?;
        if build.spec.app_ref.name != app_guid {
            return Err(Error::InvalidState(format!(
                "droplet {droplet_guid} belongs to app {}, not {app_guid}",
                build.spec.app_ref.name
            )));
        }
        if build_state(&build) != BuildState::Staged {
            return Err(Error::InvalidState(format!(
                "droplet {droplet_guid} is not staged"
            )));
        }

        let app = retry_transient(ctx.deadline, &self.retry, "set current droplet", || async {
            let mut app: CanopyApp = store.get(&namespace, app_guid).await?;
            if app.current_droplet() == Some(droplet_guid) {
                return Ok(app);
            }
            app.spec.current_droplet_ref = Some(NamedRef::new(droplet_guid));
            store.replace(&namespace, &app).await
        })
        .await
        .map_err(|e| for_resource(e, APP_RESOURCE))?;

        info!(droplet = %droplet_guid, "Set current droplet");
        Ok(AppRecord::from(&app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::conditions::{set_condition, Condition, ConditionStatus};
    use canopy_core::crd::{BuildStatus, CanopyAppSpec, CanopyBuildSpec, BUILD_SUCCEEDED};
    use canopy_core::identity::Identity;
    use canopy_core::store::MemoryStore;
    use std::time::Duration;

    const NS: &str = "space-1";

    fn ctx() -> RequestContext {
        RequestContext::new(Identity::user("alice"), Duration::from_secs(1))
    }

    async fn seed(store: &MemoryStore) {
        store
            .create(
                NS,
                &CanopyApp::new(
                    "app-1",
                    CanopyAppSpec {
                        display_name: "web".to_string(),
                        desired_state: DesiredState::Stopped,
                        current_droplet_ref: None,
                        lifecycle: Lifecycle::default(),
                        env_secret_name: None,
                    },
                ),
            )
            .await
            .unwrap();
    }

    async fn seed_build(store: &MemoryStore, name: &str, succeeded: ConditionStatus) {
        let mut build = store
            .create(
                NS,
                &CanopyBuild::new(
                    name,
                    CanopyBuildSpec {
                        package_ref: NamedRef::new("package-1"),
                        app_ref: NamedRef::new("app-1"),
                        staging_memory_mb: 0,
                        staging_disk_mb: 0,
                        lifecycle: Lifecycle::default(),
                    },
                ),
            )
            .await
            .unwrap();
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            Condition::new(BUILD_SUCCEEDED, succeeded, "Build", "", Some(1), Utc::now()),
        );
        build.status = Some(BuildStatus {
            observed_generation: 1,
            conditions,
            ..Default::default()
        });
        store.replace_status(NS, &build).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_current_droplet() {
        let store = MemoryStore::new();
        seed(&store).await;
        seed_build(&store, "build-1", ConditionStatus::True).await;
        let repo = AppRepo::new(store.clone());

        let record = repo.set_current_droplet(&ctx(), "app-1", "build-1").await.unwrap();
        assert_eq!(record.droplet_guid.as_deref(), Some("build-1"));
        assert_eq!(repo.get(&ctx(), "app-1").await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_unstaged_droplet_is_rejected() {
        let store = MemoryStore::new();
        seed(&store).await;
        seed_build(&store, "build-1", ConditionStatus::Unknown).await;
        let repo = AppRepo::new(store);

        let err = repo
            .set_current_droplet(&ctx(), "app-1", "build-1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_missing_droplet() {
        let store = MemoryStore::new();
        seed(&store).await;
        let repo = AppRepo::new(store);

        let err = repo
            .set_current_droplet(&ctx(), "app-1", "build-9")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Droplet not found"));
    }
}
