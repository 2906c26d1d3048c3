//! Spaces: `CanopySpace` objects in their org's namespace

use super::namespace_retriever::NamespaceRetriever;
use super::org::ORG_RESOURCE;
use super::{created_at, for_resource, new_guid, updated_at};
use crate::awaiter::{Awaited, ConditionAwaiter};
use canopy_core::conditions::{is_condition_true, Conditioned, READY};
use canopy_core::crd::{CanopyOrg, CanopySpace, CanopySpaceSpec};
use canopy_core::error::{Error, Result};
use canopy_core::identity::RequestContext;
use canopy_core::store::{ListOptions, Store, StoreFactory};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

pub const SPACE_RESOURCE: &str = "Space";

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceRecord {
    pub guid: String,
    pub name: String,
    pub org_guid: String,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&CanopySpace> for SpaceRecord {
    fn from(space: &CanopySpace) -> Self {
        Self {
            guid: space.name_any(),
            name: space.spec.display_name.clone(),
            org_guid: space.namespace().unwrap_or_default(),
            ready: is_condition_true(space.conditions(), READY),
            labels: space.labels().clone(),
            annotations: space.annotations().clone(),
            created_at: created_at(space),
            updated_at: updated_at(space),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSpaceMessage {
    pub name: String,
    pub org_guid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListSpacesMessage {
    /// Orgs to search; empty searches every org
    pub org_guids: Vec<String>,
    /// Display names to keep; empty keeps all
    pub names: Vec<String>,
}

#[derive(Clone)]
pub struct SpaceRepo<F> {
    factory: F,
    namespaces: NamespaceRetriever<F>,
    root_namespace: String,
}

impl<F: StoreFactory> SpaceRepo<F> {
    pub fn new(factory: F, root_namespace: impl Into<String>) -> Self {
        Self {
            namespaces: NamespaceRetriever::new(factory.clone()),
            factory,
            root_namespace: root_namespace.into(),
        }
    }

    /// Create a space inside an org and wait until its namespace is ready
    #[instrument(skip(self, ctx, message), fields(user = %ctx.identity, org = %message.org_guid, name = %message.name))]
    pub async fn create(&self, ctx: &RequestContext, message: CreateSpaceMessage) -> Result<SpaceRecord> {
        let store = self.factory.for_identity(&ctx.identity)?;
        let org: CanopyOrg = store
            .get(&self.root_namespace, &message.org_guid)
            .await
            .map_err(|e| for_resource(e, ORG_RESOURCE))?;
        let org_namespace = org.name_any();

        let guid = new_guid();
        let mut space = CanopySpace::new(
            &guid,
            CanopySpaceSpec {
                display_name: message.name,
            },
        );
        space.metadata.labels = Some(message.labels);
        space.metadata.annotations = Some(message.annotations);

        let created = store.create(&org_namespace, &space).await?;
        info!(guid = %guid, "Created space, waiting for it to become ready");

        let ready = ConditionAwaiter::new(store)
            .await_after_write(ctx.deadline, &org_namespace, created, Awaited::is_true(READY))
            .await
            .map_err(|e| for_resource(e, SPACE_RESOURCE))?;
        Ok(SpaceRecord::from(&ready))
    }

    pub async fn get(&self, ctx: &RequestContext, guid: &str) -> Result<SpaceRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopySpace>(guid, SPACE_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        let space: CanopySpace = store
            .get(&namespace, guid)
            .await
            .map_err(|e| for_resource(e, SPACE_RESOURCE))?;
        Ok(SpaceRecord::from(&space))
    }

    /// Spaces in the orgs the caller can see into
    pub async fn list(&self, ctx: &RequestContext, message: &ListSpacesMessage) -> Result<Vec<SpaceRecord>> {
        let orgs = self
            .factory
            .privileged()
            .list::<CanopyOrg>(&self.root_namespace, &ListOptions::default())
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let mut records = Vec::new();
        for org in orgs.items {
            let org_guid = org.name_any();
            if !message.org_guids.is_empty() && !message.org_guids.contains(&org_guid) {
                continue;
            }
            let spaces = match store
                .list::<CanopySpace>(&org_guid, &ListOptions::default())
                .await
            {
                Ok(list) => list.items,
                Err(Error::Forbidden(_)) => {
                    debug!(user = %ctx.identity, org = %org_guid, "Skipping org without access");
                    continue;
                }
                Err(e) => return Err(e),
            };
            records.extend(
                spaces
                    .iter()
                    .filter(|s| message.names.is_empty() || message.names.contains(&s.spec.display_name))
                    .map(SpaceRecord::from),
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::crd::CanopyOrgSpec;
    use canopy_core::identity::Identity;
    use canopy_core::store::MemoryStore;
    use std::time::Duration;

    const ROOT: &str = "canopy";

    async fn seed(store: &MemoryStore) {
        for org in ["org-1", "org-2"] {
            store
                .create(
                    ROOT,
                    &CanopyOrg::new(
                        org,
                        CanopyOrgSpec {
                            display_name: org.to_string(),
                        },
                    ),
                )
                .await
                .unwrap();
        }
        for (org, space, name) in [
            ("org-1", "space-1", "dev"),
            ("org-1", "space-2", "prod"),
            ("org-2", "space-3", "dev"),
        ] {
            store
                .create(
                    org,
                    &CanopySpace::new(
                        space,
                        CanopySpaceSpec {
                            display_name: name.to_string(),
                        },
                    ),
                )
                .await
                .unwrap();
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Identity::user("alice"), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_get_resolves_org_namespace() {
        let store = MemoryStore::new();
        seed(&store).await;
        let repo = SpaceRepo::new(store, ROOT);

        let record = repo.get(&ctx(), "space-3").await.unwrap();
        assert_eq!(record.org_guid, "org-2");
        assert_eq!(record.name, "dev");
    }

    #[tokio::test]
    async fn test_list_skips_orgs_without_access() {
        let store = MemoryStore::new();
        seed(&store).await;
        store.deny("alice", "org-2");
        let repo = SpaceRepo::new(store, ROOT);

        let records = repo
            .list(
                &ctx(),
                &ListSpacesMessage {
                    names: vec!["dev".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].guid, "space-1");
    }

    #[tokio::test]
    async fn test_create_in_missing_org() {
        let repo = SpaceRepo::new(MemoryStore::new(), ROOT);
        let err = repo
            .create(
                &ctx(),
                CreateSpaceMessage {
                    name: "dev".to_string(),
                    org_guid: "org-9".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Org not found"));
    }
}
