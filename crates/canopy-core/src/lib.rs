//! # Canopy Core
//!
//! Shared model for the Canopy platform: the resource catalogue, the condition
//! model every resource reports convergence through, and the declarative store
//! adapter used by both the controllers and the synchronous API layer.
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definitions (`canopy.io/v1alpha1`) with validation
//! - [`conditions`] - Condition sets, generation fencing and the [`Conditioned`] trait
//! - [`store`] - Typed store operations, Kubernetes-backed and in-memory
//! - [`labels`] - Well-known label/annotation keys and label-map helpers
//! - [`identity`] - Caller identity, deadlines and request context
//! - [`retry`] - Deadline-bounded retry of transient store failures
//! - [`state`] - Pure reconciliation state machines, one per workload kind
//! - [`error`] - Error taxonomy shared by every layer
//! - [`env`] - `${VAR:-default}` expansion for configuration files
//!
//! ## Tenant hierarchy
//!
//! ```yaml
//! apiVersion: canopy.io/v1alpha1
//! kind: CanopyOrg
//! metadata:
//!   name: 5f0c6d3e-org          # GUID, also the org namespace
//!   namespace: canopy-root
//! spec:
//!   displayName: payments
//! ---
//! apiVersion: canopy.io/v1alpha1
//! kind: CanopySpace
//! metadata:
//!   name: 9a41b7c2-space        # GUID, also the space namespace
//!   namespace: 5f0c6d3e-org
//! spec:
//!   displayName: staging
//! ```
//!
//! Workloads (apps, builds, tasks, service bindings) live in their space's
//! namespace and are identified by the GUID in `metadata.name`.

pub mod conditions;
pub mod crd;
pub mod env;
pub mod error;
pub mod identity;
pub mod labels;
pub mod retry;
pub mod state;
pub mod store;

pub use conditions::Conditioned;
pub use error::{Error, Result};

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::conditions::{
        condition_reached, condition_status, find_condition, is_condition_true, is_stale,
        set_condition, Condition, ConditionStatus, Conditioned, READY,
    };
    pub use crate::crd::*;
    pub use crate::error::{Error, Result};
    pub use crate::identity::{Deadline, Identity, RequestContext};
    pub use crate::retry::{retry_transient, RetryPolicy};
    pub use crate::state::Transition;
    pub use crate::store::{
        owner_reference, set_owner, KubeStore, KubeStoreFactory, ListOptions, MemoryStore,
        ObjectList, Store, StoreEvent, StoreFactory, StoreObject,
    };
}
