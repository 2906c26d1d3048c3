//! Controller configuration
//!
//! Loaded from a YAML file; `${VAR}` and `${VAR:-default}` references are
//! expanded from the environment before parsing.
//!
//! ```yaml
//! rootNamespace: canopy
//! containerRegistrySecretNames:
//!   - image-registry-credentials
//! taskDefaults:
//!   memoryMb: 500
//!   diskQuotaMb: 1024
//! taskTtlSeconds: 2592000
//! maxRetainedBuildsPerApp: 5
//! ```

use canopy_core::env::expand_env_vars;
use canopy_core::labels::{is_valid_name, validate_qualified_key, PROPAGATE_ROLE_BINDING_ANNOTATION};
use canopy_core::state::task::TaskDefaults;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration of the controllers
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace holding the org objects and the secrets/role bindings
    /// propagated into every org
    #[serde(default = "default_root_namespace")]
    pub root_namespace: String,

    /// Secrets copied from parent to child namespaces
    #[serde(default)]
    pub container_registry_secret_names: Vec<String>,

    /// Annotation a role binding must carry (with value `"true"`) to be
    /// propagated
    #[serde(default = "default_role_binding_annotation")]
    pub role_binding_propagation_annotation: String,

    #[serde(default)]
    pub task_defaults: TaskDefaultsConfig,

    /// How long a completed task is kept
    #[serde(default = "default_task_ttl_seconds")]
    pub task_ttl_seconds: u64,

    /// Succeeded builds kept per app, the current droplet aside
    #[serde(default = "default_max_retained_builds")]
    pub max_retained_builds_per_app: usize,

    /// Periodic resync of converged objects
    #[serde(default = "default_requeue_seconds")]
    pub requeue_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefaultsConfig {
    #[serde(default = "default_task_memory_mb")]
    pub memory_mb: i64,

    #[serde(default = "default_task_disk_mb")]
    pub disk_quota_mb: i64,
}

impl Default for TaskDefaultsConfig {
    fn default() -> Self {
        Self {
            memory_mb: default_task_memory_mb(),
            disk_quota_mb: default_task_disk_mb(),
        }
    }
}

fn default_root_namespace() -> String {
    "canopy".to_string()
}

fn default_role_binding_annotation() -> String {
    PROPAGATE_ROLE_BINDING_ANNOTATION.to_string()
}

fn default_task_ttl_seconds() -> u64 {
    30 * 24 * 60 * 60
}

fn default_max_retained_builds() -> usize {
    5
}

fn default_requeue_seconds() -> u64 {
    300
}

fn default_task_memory_mb() -> i64 {
    500
}

fn default_task_disk_mb() -> i64 {
    1024
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            root_namespace: default_root_namespace(),
            container_registry_secret_names: Vec::new(),
            role_binding_propagation_annotation: default_role_binding_annotation(),
            task_defaults: TaskDefaultsConfig::default(),
            task_ttl_seconds: default_task_ttl_seconds(),
            max_retained_builds_per_app: default_max_retained_builds(),
            requeue_interval_seconds: default_requeue_seconds(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_valid_name(&self.root_namespace) {
            anyhow::bail!(
                "rootNamespace '{}' is not a valid namespace name",
                self.root_namespace
            );
        }
        for name in &self.container_registry_secret_names {
            if !is_valid_name(name) {
                anyhow::bail!("containerRegistrySecretNames: '{}' is not a valid secret name", name);
            }
        }
        if let Err(e) = validate_qualified_key(&self.role_binding_propagation_annotation) {
            anyhow::bail!("roleBindingPropagationAnnotation is invalid: {}", e);
        }
        if self.task_defaults.memory_mb <= 0 || self.task_defaults.disk_quota_mb <= 0 {
            anyhow::bail!("taskDefaults must be positive");
        }
        if self.task_ttl_seconds == 0 {
            anyhow::bail!("taskTtlSeconds must be greater than zero");
        }
        if self.requeue_interval_seconds == 0 {
            anyhow::bail!("requeueIntervalSeconds must be greater than zero");
        }
        Ok(())
    }

    pub fn task_defaults(&self) -> TaskDefaults {
        TaskDefaults {
            memory_mb: self.task_defaults.memory_mb,
            disk_quota_mb: self.task_defaults.disk_quota_mb,
        }
    }

    pub fn task_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.task_ttl_seconds).unwrap_or(i64::MAX / 1000))
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_seconds)
    }
}
