//! # Canopy API Repositories
//!
//! The layer between the Canopy HTTP handlers and the declarative store. A
//! handler builds a [`RequestContext`](canopy_core::identity::RequestContext)
//! from the authenticated caller and its timeout, and calls a repository. The
//! repository acts through a store impersonating the caller and returns a
//! record once the controllers have reported the relevant condition, or an
//! [`Error`](canopy_core::Error) from the shared taxonomy.
//!
//! ## Modules
//!
//! - [`awaiter`] - Deadline-bounded wait for a condition over a store watch
//! - [`repositories`] - Orgs, spaces, apps, builds, tasks, deployments and
//!   service bindings
//! - [`config`] - YAML configuration of the API layer
//!
//! ## Example
//!
//! ```rust,ignore
//! use canopy_api::prelude::*;
//! use std::time::Duration;
//!
//! let factory = KubeStoreFactory::infer().await?;
//! let tasks = TaskRepo::new(factory);
//! let ctx = RequestContext::new(Identity::user("alice"), Duration::from_secs(30));
//! let task = tasks
//!     .create(&ctx, CreateTaskMessage {
//!         app_guid: app_guid.to_string(),
//!         command: vec!["rake".into(), "db:migrate".into()],
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("task {} is {}", task.sequence_id, task.state.as_str());
//! ```

pub mod awaiter;
pub mod config;
pub mod repositories;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::awaiter::{Awaited, ConditionAwaiter};
    pub use crate::config::ApiConfig;
    pub use crate::repositories::app::{AppRecord, AppRepo};
    pub use crate::repositories::build::{BuildRecord, BuildRepo, CreateBuildMessage};
    pub use crate::repositories::deployment::{
        CreateDeploymentMessage, DeploymentRecord, DeploymentRepo,
    };
    pub use crate::repositories::namespace_retriever::NamespaceRetriever;
    pub use crate::repositories::org::{CreateOrgMessage, ListOrgsMessage, OrgRecord, OrgRepo};
    pub use crate::repositories::service_binding::{
        CreateServiceBindingMessage, ServiceBindingRecord, ServiceBindingRepo,
    };
    pub use crate::repositories::space::{
        CreateSpaceMessage, ListSpacesMessage, SpaceRecord, SpaceRepo,
    };
    pub use crate::repositories::task::{
        CreateTaskMessage, ListTasksMessage, MetadataPatch, TaskRecord, TaskRepo,
    };
    pub use canopy_core::error::{Error, Result};
    pub use canopy_core::identity::{Deadline, Identity, RequestContext};
    pub use canopy_core::store::{KubeStoreFactory, MemoryStore, StoreFactory};
}
