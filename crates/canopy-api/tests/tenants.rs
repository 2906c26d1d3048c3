//! Org and Space Integration Tests
//!
//! Creates orgs and spaces through the repositories while the tenant
//! controllers reconcile in the background, and checks what callers with and
//! without access get to see.
//!
//! Run with: cargo test -p canopy-api --test tenants -- --nocapture

use anyhow::Result;
use canopy_api::prelude::*;
use canopy_core::crd::{CanopyOrg, CanopySpace};
use canopy_core::store::Store;
use canopy_operator::config::ControllerConfig;
use canopy_operator::controller::ControllerContext;
use canopy_operator::tenant_controller::reconcile;
use k8s_openapi::api::core::v1::Namespace;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

const ROOT: &str = "canopy";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("canopy_api=debug,canopy_operator=info")
        .with_test_writer()
        .try_init();
}

fn ctx(user: &str) -> RequestContext {
    RequestContext::new(Identity::user(user), Duration::from_secs(5))
}

fn spawn_tenant_controllers(store: &MemoryStore) -> JoinHandle<()> {
    let store = store.clone();
    tokio::spawn(async move {
        let ctx = Arc::new(ControllerContext::new(
            store.clone(),
            Arc::new(ControllerConfig::default()),
        ));
        loop {
            for org in store.objects::<CanopyOrg>(ROOT) {
                let _ = reconcile(Arc::new(org), ctx.clone()).await;
            }
            for space in store.objects::<CanopySpace>("") {
                let _ = reconcile(Arc::new(space), ctx.clone()).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

// =============================================================================
// CREATE AND READ
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_org_and_space_become_ready() -> Result<()> {
    init_tracing();
    let store = MemoryStore::new();
    let controllers = spawn_tenant_controllers(&store);
    let orgs = OrgRepo::new(store.clone(), ROOT);
    let spaces = SpaceRepo::new(store.clone(), ROOT);

    let org = orgs
        .create(
            &ctx("alice"),
            CreateOrgMessage {
                name: "payments".to_string(),
                ..Default::default()
            },
        )
        .await?;
    assert!(org.ready);

    let space = spaces
        .create(
            &ctx("alice"),
            CreateSpaceMessage {
                name: "staging".to_string(),
                org_guid: org.guid.clone(),
                ..Default::default()
            },
        )
        .await?;
    info!(org = %org.guid, space = %space.guid, "Created tenants");

    assert!(space.ready);
    assert_eq!(space.org_guid, org.guid);
    assert_eq!(spaces.get(&ctx("alice"), &space.guid).await?.name, "staging");

    // Each tenant got its namespace
    let _: Namespace = store.get("", &org.guid).await?;
    let _: Namespace = store.get("", &space.guid).await?;

    controllers.abort();
    Ok(())
}

// =============================================================================
// VISIBILITY
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_spaces_of_hidden_org_are_not_listed() -> Result<()> {
    init_tracing();
    let store = MemoryStore::new();
    let controllers = spawn_tenant_controllers(&store);
    let orgs = OrgRepo::new(store.clone(), ROOT);
    let spaces = SpaceRepo::new(store.clone(), ROOT);

    let mut org_guids = Vec::new();
    for name in ["payments", "search"] {
        let org = orgs
            .create(
                &ctx("admin"),
                CreateOrgMessage {
                    name: name.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        spaces
            .create(
                &ctx("admin"),
                CreateSpaceMessage {
                    name: "dev".to_string(),
                    org_guid: org.guid.clone(),
                    ..Default::default()
                },
            )
            .await?;
        org_guids.push(org.guid);
    }

    store.deny("bob", &org_guids[1]);
    let visible = spaces.list(&ctx("bob"), &ListSpacesMessage::default()).await?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].org_guid, org_guids[0]);

    let by_org = spaces
        .list(
            &ctx("admin"),
            &ListSpacesMessage {
                org_guids: vec![org_guids[1].clone()],
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(by_org.len(), 1);

    controllers.abort();
    Ok(())
}
