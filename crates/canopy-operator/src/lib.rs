//! # Canopy Controllers
//!
//! Reconciliation controllers for the Canopy platform and the engine that
//! propagates registry secrets and role bindings down the tenant namespace
//! hierarchy.
//!
//! ## Controllers
//!
//! | Resource               | Owns            | Converges to                                  |
//! |------------------------|-----------------|-----------------------------------------------|
//! | `CanopyOrg`            | namespace       | namespace with propagated secrets and bindings |
//! | `CanopySpace`          | namespace       | same, with the org namespace as parent        |
//! | `CanopyBuild`          | `BuildWorkload` | `Succeeded` True with a droplet, or False     |
//! | `CanopyTask`           | `TaskWorkload`  | `Succeeded` or `Failed`, deleted after its TTL |
//! | `CanopyApp`            | `AppWorkload`   | `Ready` at the app's current revision         |
//! | `CanopyServiceBinding` |                 | `BindingSecretAvailable` and `Ready`          |
//!
//! Every reconcile function is generic over
//! [`Store`](canopy_core::store::Store): the `run_*` entry points drive them
//! against the Kubernetes API, tests drive them against
//! [`MemoryStore`](canopy_core::store::MemoryStore).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use canopy_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let config = Arc::new(ControllerConfig::default());
//!     run_org_controller(client, config, None).await
//! }
//! ```
//!
//! ## Metrics
//!
//! Each controller records, labeled by `controller`:
//!
//! - `canopy_operator_reconciliations_total` - Total reconciliation attempts
//! - `canopy_operator_reconciliation_errors_total` - Reconciliation errors
//! - `canopy_operator_reconciliation_duration_seconds` - Reconciliation latency

pub mod app_controller;
pub mod build_controller;
pub mod config;
pub mod controller;
pub mod error;
pub mod propagation;
pub mod service_binding_controller;
pub mod task_controller;
pub mod tenant_controller;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::app_controller::run_app_controller;
    pub use crate::build_controller::{run_build_controller, ImageInspector, WorkloadImageInspector};
    pub use crate::config::ControllerConfig;
    pub use crate::controller::{ControllerContext, ControllerMetrics};
    pub use crate::error::{OperatorError, Result};
    pub use crate::propagation::{
        PropagatedKind, PropagationError, PropagationReport, PropagationRequest, Propagator,
    };
    pub use crate::service_binding_controller::run_service_binding_controller;
    pub use crate::task_controller::run_task_controller;
    pub use crate::tenant_controller::{run_org_controller, run_space_controller};
}
