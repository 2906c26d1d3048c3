//! Custom Resource Definitions for the Canopy platform
//!
//! Tenancy (`CanopyOrg`, `CanopySpace`), workloads (`CanopyApp`,
//! `CanopyPackage`, `CanopyBuild`, `CanopyTask`, `CanopyServiceInstance`,
//! `CanopyServiceBinding`) and the resources owned by external runners
//! (`BuildWorkload`, `TaskWorkload`, `AppWorkload`).
//!
//! Every resource is identified by a GUID stored in `metadata.name`.

use crate::conditions::{Condition, Conditioned};
use crate::labels::{is_valid_name, APP_REVISION_ANNOTATION};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::{Validate, ValidationError};

pub const GROUP: &str = "canopy.io";
pub const VERSION: &str = "v1alpha1";

pub const REFERENCES_RESOLVED: &str = "ReferencesResolved";

pub const BUILD_STAGING: &str = "Staging";
pub const BUILD_SUCCEEDED: &str = "Succeeded";

pub const TASK_INITIALIZED: &str = "Initialized";
pub const TASK_STARTED: &str = "Started";
pub const TASK_SUCCEEDED: &str = "Succeeded";
pub const TASK_FAILED: &str = "Failed";
pub const TASK_CANCELED: &str = "Canceled";

pub const BINDING_SECRET_AVAILABLE: &str = "BindingSecretAvailable";

fn validate_name_ref(value: &NamedRef) -> Result<(), ValidationError> {
    if is_valid_name(&value.name) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value.name).into(),
        ))
    }
}

fn validate_command(command: &[String]) -> Result<(), ValidationError> {
    if command.iter().all(|part| part.trim().is_empty()) {
        return Err(ValidationError::new("empty_command")
            .with_message("task command must not be empty".into()));
    }
    Ok(())
}

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NamedRef {
    pub name: String,
}

impl NamedRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// ---------------------------------------------------------------------------
// Tenancy
// ---------------------------------------------------------------------------

/// A tenant organization, backed by its own namespace
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopyOrg",
    plural = "canopyorgs",
    shortname = "corg",
    namespaced,
    status = "TenantStatus",
    printcolumn = r#"{"name":"Display Name", "type":"string", "jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type == 'Ready')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyOrgSpec {
    /// Human-readable organization name
    #[validate(length(min = 1, max = 255, message = "display name must be 1-255 characters"))]
    pub display_name: String,
}

/// A space inside an organization, backed by its own namespace
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopySpace",
    plural = "canopyspaces",
    shortname = "cspace",
    namespaced,
    status = "TenantStatus",
    printcolumn = r#"{"name":"Display Name", "type":"string", "jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type == 'Ready')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanopySpaceSpec {
    /// Human-readable space name
    #[validate(length(min = 1, max = 255, message = "display name must be 1-255 characters"))]
    pub display_name: String,
}

/// Status shared by orgs and spaces
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Name of the namespace backing this tenant
    #[serde(default)]
    pub guid: String,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// ---------------------------------------------------------------------------
// Apps
// ---------------------------------------------------------------------------

/// Desired run state of an app
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum DesiredState {
    Started,
    #[default]
    Stopped,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredState::Started => f.write_str("STARTED"),
            DesiredState::Stopped => f.write_str("STOPPED"),
        }
    }
}

/// How an app is staged
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    /// "buildpack" or "docker"
    #[serde(default = "default_lifecycle_type")]
    pub r#type: String,

    #[serde(default)]
    pub buildpacks: Vec<String>,

    #[serde(default)]
    pub stack: String,
}

fn default_lifecycle_type() -> String {
    "buildpack".to_string()
}

/// An application, the deployment target
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopyApp",
    plural = "canopyapps",
    shortname = "capp",
    namespaced,
    status = "AppStatus",
    printcolumn = r#"{"name":"Display Name", "type":"string", "jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".spec.desiredState"}"#,
    printcolumn = r#"{"name":"Droplet", "type":"string", "jsonPath":".spec.currentDropletRef.name"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type == 'Ready')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyAppSpec {
    #[validate(length(min = 1, max = 255, message = "display name must be 1-255 characters"))]
    pub display_name: String,

    #[serde(default)]
    pub desired_state: DesiredState,

    /// Droplet (succeeded build) the app runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_droplet_ref: Option<NamedRef>,

    #[serde(default)]
    pub lifecycle: Lifecycle,

    /// Secret holding user-provided environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Revision the running workload last reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_revision: Option<String>,
}

impl CanopyApp {
    /// Raw value of the revision annotation
    pub fn revision(&self) -> Option<&str> {
        self.annotations()
            .get(APP_REVISION_ANNOTATION)
            .map(String::as_str)
    }

    pub fn current_droplet(&self) -> Option<&str> {
        self.spec
            .current_droplet_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// A process type exposed by a droplet
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessType {
    pub r#type: String,
    pub command: String,
}

impl ProcessType {
    pub fn new(r#type: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            command: command.into(),
        }
    }
}

/// Resource owned by the app runner for a started app
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "AppWorkload",
    plural = "appworkloads",
    namespaced,
    status = "AppWorkloadStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AppWorkloadSpec {
    pub app_guid: String,

    /// Value of the app revision annotation this workload runs
    pub revision: String,

    pub image: String,

    #[serde(default)]
    pub image_pull_secrets: Vec<NamedRef>,

    #[serde(default)]
    pub processes: Vec<ProcessType>,

    #[serde(default)]
    pub ports: Vec<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppWorkloadStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_revision: Option<String>,
}

// ---------------------------------------------------------------------------
// Packages and builds
// ---------------------------------------------------------------------------

/// Location of an image in a registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub image_pull_secrets: Vec<NamedRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageSource {
    #[serde(default)]
    pub registry: Registry,
}

/// Uploaded application source
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopyPackage",
    plural = "canopypackages",
    shortname = "cpkg",
    namespaced,
    status = "PackageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyPackageSpec {
    /// "bits" or "docker"
    #[serde(default = "default_package_type")]
    pub r#type: String,

    #[validate(custom(function = "validate_name_ref"))]
    pub app_ref: NamedRef,

    #[serde(default)]
    pub source: PackageSource,
}

fn default_package_type() -> String {
    "bits".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A staging run of a package into a droplet
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopyBuild",
    plural = "canopybuilds",
    shortname = "cbuild",
    namespaced,
    status = "BuildStatus",
    printcolumn = r#"{"name":"App", "type":"string", "jsonPath":".spec.appRef.name"}"#,
    printcolumn = r#"{"name":"Staging", "type":"string", "jsonPath":".status.conditions[?(@.type == 'Staging')].status"}"#,
    printcolumn = r#"{"name":"Succeeded", "type":"string", "jsonPath":".status.conditions[?(@.type == 'Succeeded')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyBuildSpec {
    #[validate(custom(function = "validate_name_ref"))]
    pub package_ref: NamedRef,

    #[validate(custom(function = "validate_name_ref"))]
    pub app_ref: NamedRef,

    #[serde(default)]
    #[validate(range(min = 0, max = 32768, message = "staging memory must be at most 32768 MB"))]
    pub staging_memory_mb: i64,

    #[serde(default)]
    #[validate(range(min = 0, max = 65536, message = "staging disk must be at most 65536 MB"))]
    pub staging_disk_mb: i64,

    #[serde(default)]
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Set once the build succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub droplet: Option<DropletStatus>,
}

/// The runnable artifact produced by a successful build
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DropletStatus {
    pub registry: Registry,

    #[serde(default)]
    pub stack: String,

    #[serde(default)]
    pub process_types: Vec<ProcessType>,

    #[serde(default)]
    pub ports: Vec<i32>,
}

/// Resource owned by the external build service
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "BuildWorkload",
    plural = "buildworkloads",
    namespaced,
    status = "BuildWorkloadStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildWorkloadSpec {
    pub build_ref: NamedRef,

    #[serde(default)]
    pub source: PackageSource,

    #[serde(default)]
    pub buildpacks: Vec<String>,

    #[serde(default)]
    pub stack: String,

    /// Secret holding the app's environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_secret_name: Option<String>,

    /// Credential secrets of bound services
    #[serde(default)]
    pub services: Vec<NamedRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildWorkloadStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub droplet: Option<BuildWorkloadDroplet>,
}

/// What the build service reports about the image it produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildWorkloadDroplet {
    pub registry: Registry,

    #[serde(default)]
    pub stack: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_types: Option<Vec<ProcessType>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<i32>>,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// A one-off command run against an app's droplet
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopyTask",
    plural = "canopytasks",
    shortname = "ctask",
    namespaced,
    status = "TaskStatus",
    printcolumn = r#"{"name":"App", "type":"string", "jsonPath":".spec.appRef.name"}"#,
    printcolumn = r#"{"name":"Sequence", "type":"integer", "jsonPath":".status.sequenceId"}"#,
    printcolumn = r#"{"name":"Canceled", "type":"boolean", "jsonPath":".spec.canceled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyTaskSpec {
    #[validate(custom(function = "validate_command"))]
    pub command: Vec<String>,

    #[validate(custom(function = "validate_name_ref"))]
    pub app_ref: NamedRef,

    #[serde(default)]
    pub canceled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub sequence_id: i64,

    #[serde(default)]
    pub memory_mb: i64,

    #[serde(default)]
    pub disk_quota_mb: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub droplet_ref: Option<NamedRef>,
}

/// Resource owned by the external task runner
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "TaskWorkload",
    plural = "taskworkloads",
    namespaced,
    status = "TaskWorkloadStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TaskWorkloadSpec {
    pub image: String,

    #[serde(default)]
    pub image_pull_secrets: Vec<NamedRef>,

    pub command: Vec<String>,

    pub memory_mb: i64,

    pub disk_mb: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskWorkloadStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// A service instance whose credentials live in a secret
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopyServiceInstance",
    plural = "canopyserviceinstances",
    shortname = "csi",
    namespaced,
    status = "ServiceInstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyServiceInstanceSpec {
    #[validate(length(min = 1, max = 255, message = "display name must be 1-255 characters"))]
    pub display_name: String,

    /// Secret holding the instance credentials
    #[serde(default)]
    pub secret_name: String,

    /// "user-provided" or "managed"
    #[serde(default = "default_instance_type")]
    pub r#type: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_instance_type() -> String {
    "user-provided".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Binding of a service instance to an app
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "canopy.io",
    version = "v1alpha1",
    kind = "CanopyServiceBinding",
    plural = "canopyservicebindings",
    shortname = "csb",
    namespaced,
    status = "ServiceBindingStatus",
    printcolumn = r#"{"name":"App", "type":"string", "jsonPath":".spec.appRef.name"}"#,
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.service.name"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type == 'Ready')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanopyServiceBindingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// The bound service instance
    #[validate(custom(function = "validate_name_ref"))]
    pub service: NamedRef,

    #[validate(custom(function = "validate_name_ref"))]
    pub app_ref: NamedRef,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Secret exposing the credentials to the app
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<NamedRef>,
}

macro_rules! impl_conditioned {
    ($($kind:ty),* $(,)?) => {
        $(
            impl Conditioned for $kind {
                fn conditions(&self) -> &[Condition] {
                    self.status
                        .as_ref()
                        .map(|s| s.conditions.as_slice())
                        .unwrap_or_default()
                }

                fn observed_generation(&self) -> Option<i64> {
                    self.status.as_ref().map(|s| s.observed_generation)
                }
            }
        )*
    };
}

impl_conditioned!(
    CanopyOrg,
    CanopySpace,
    CanopyApp,
    AppWorkload,
    CanopyPackage,
    CanopyBuild,
    BuildWorkload,
    CanopyTask,
    TaskWorkload,
    CanopyServiceInstance,
    CanopyServiceBinding,
);
