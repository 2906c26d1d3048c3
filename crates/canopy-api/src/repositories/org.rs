//! Orgs: `CanopyOrg` objects in the root namespace

use super::{created_at, for_resource, new_guid, updated_at};
use crate::awaiter::{Awaited, ConditionAwaiter};
use canopy_core::conditions::{is_condition_true, Conditioned, READY};
use canopy_core::crd::{CanopyOrg, CanopyOrgSpec};
use canopy_core::error::{Error, Result};
use canopy_core::identity::RequestContext;
use canopy_core::store::{ListOptions, Store, StoreFactory};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

pub const ORG_RESOURCE: &str = "Org";

#[derive(Debug, Clone, PartialEq)]
pub struct OrgRecord {
    pub guid: String,
    pub name: String,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&CanopyOrg> for OrgRecord {
    fn from(org: &CanopyOrg) -> Self {
        Self {
            guid: org.name_any(),
            name: org.spec.display_name.clone(),
            ready: is_condition_true(org.conditions(), READY),
            labels: org.labels().clone(),
            annotations: org.annotations().clone(),
            created_at: created_at(org),
            updated_at: updated_at(org),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOrgMessage {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOrgsMessage {
    /// Display names to keep; empty keeps all
    pub names: Vec<String>,
}

#[derive(Clone)]
pub struct OrgRepo<F> {
    factory: F,
    root_namespace: String,
}

impl<F: StoreFactory> OrgRepo<F> {
    pub fn new(factory: F, root_namespace: impl Into<String>) -> Self {
        Self {
            factory,
            root_namespace: root_namespace.into(),
        }
    }

    /// Create an org and wait until its namespace is ready
    #[instrument(skip(self, ctx, message), fields(user = %ctx.identity, name = %message.name))]
    pub async fn create(&self, ctx: &RequestContext, message: CreateOrgMessage) -> Result<OrgRecord> {
        let store = self.factory.for_identity(&ctx.identity)?;

        let guid = new_guid();
        let mut org = CanopyOrg::new(
            &guid,
            CanopyOrgSpec {
                display_name: message.name,
            },
        );
        org.metadata.labels = Some(message.labels);
        org.metadata.annotations = Some(message.annotations);

        let created = store.create(&self.root_namespace, &org).await?;
        info!(guid = %guid, "Created org, waiting for it to become ready");

        let ready = ConditionAwaiter::new(store)
            .await_after_write(ctx.deadline, &self.root_namespace, created, Awaited::is_true(READY))
            .await
            .map_err(|e| for_resource(e, ORG_RESOURCE))?;
        Ok(OrgRecord::from(&ready))
    }

    pub async fn get(&self, ctx: &RequestContext, guid: &str) -> Result<OrgRecord> {
        let store = self.factory.for_identity(&ctx.identity)?;
        let org: CanopyOrg = store
            .get(&self.root_namespace, guid)
            .await
            .map_err(|e| for_resource(e, ORG_RESOURCE))?;
        Ok(OrgRecord::from(&org))
    }

    /// Orgs visible to the caller; a caller without access to the root
    /// namespace sees none
    pub async fn list(&self, ctx: &RequestContext, message: &ListOrgsMessage) -> Result<Vec<OrgRecord>> {
        let store = self.factory.for_identity(&ctx.identity)?;
        let orgs = match store
            .list::<CanopyOrg>(&self.root_namespace, &ListOptions::default())
            .await
        {
            Ok(list) => list.items,
            Err(Error::Forbidden(reason)) => {
                debug!(user = %ctx.identity, reason = %reason, "Root namespace not visible");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        Ok(orgs
            .iter()
            .filter(|org| message.names.is_empty() || message.names.contains(&org.spec.display_name))
            .map(OrgRecord::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::conditions::{set_condition, Condition, ConditionStatus};
    use canopy_core::crd::TenantStatus;
    use canopy_core::identity::Identity;
    use canopy_core::store::MemoryStore;
    use std::time::Duration;

    const ROOT: &str = "canopy";

    fn ctx(timeout: Duration) -> RequestContext {
        RequestContext::new(Identity::user("alice"), timeout)
    }

    /// Stands in for the org controller: marks every org ready
    async fn mark_ready(store: &MemoryStore) {
        for mut org in store.objects::<CanopyOrg>(ROOT) {
            let mut conditions = vec![];
            set_condition(
                &mut conditions,
                Condition::new(READY, ConditionStatus::True, "Ready", "", Some(1), Utc::now()),
            );
            org.status = Some(TenantStatus {
                guid: org.name_any(),
                observed_generation: 1,
                conditions,
            });
            store.replace_status(ROOT, &org).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_for_ready() {
        let store = MemoryStore::new();
        let controller = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            mark_ready(&controller).await;
        });

        let repo = OrgRepo::new(store.clone(), ROOT);
        let record = repo
            .create(
                &ctx(Duration::from_secs(5)),
                CreateOrgMessage {
                    name: "payments".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(record.ready);
        assert_eq!(record.name, "payments");
        assert_eq!(repo.get(&ctx(Duration::from_secs(1)), &record.guid).await.unwrap(), record);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_times_out_without_controller() {
        let repo = OrgRepo::new(MemoryStore::new(), ROOT);
        let err = repo
            .create(
                &ctx(Duration::from_secs(1)),
                CreateOrgMessage {
                    name: "payments".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref condition, .. } if condition == READY));
    }

    #[tokio::test]
    async fn test_list_filters_by_name_and_access() {
        let store = MemoryStore::new();
        for (guid, name) in [("org-1", "payments"), ("org-2", "search")] {
            store
                .create(
                    ROOT,
                    &CanopyOrg::new(
                        guid,
                        CanopyOrgSpec {
                            display_name: name.to_string(),
                        },
                    ),
                )
                .await
                .unwrap();
        }
        let repo = OrgRepo::new(store.clone(), ROOT);
        let ctx = ctx(Duration::from_secs(1));

        let all = repo.list(&ctx, &ListOrgsMessage::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = repo
            .list(
                &ctx,
                &ListOrgsMessage {
                    names: vec!["search".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].guid, "org-2");

        store.deny("alice", ROOT);
        assert!(repo.list(&ctx, &ListOrgsMessage::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_org() {
        let repo = OrgRepo::new(MemoryStore::new(), ROOT);
        let err = repo.get(&ctx(Duration::from_secs(1)), "nope").await.unwrap_err();
        assert!(err.to_string().starts_with("Org not found"));
    }
}
