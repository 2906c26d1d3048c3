//! API layer configuration
//!
//! ```yaml
//! rootNamespace: canopy
//! requestTimeoutSeconds: 30
//! containerRegistrySecretNames:
//!   - image-registry-credentials
//! ```

use canopy_core::env::expand_env_vars;
use canopy_core::labels::is_valid_name;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Namespace holding the org objects
    #[serde(default = "default_root_namespace")]
    pub root_namespace: String,

    /// Upper bound for a single request, awaits included
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Pull secrets attached to builds created through the API
    #[serde(default)]
    pub container_registry_secret_names: Vec<String>,
}

fn default_root_namespace() -> String {
    "canopy".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            root_namespace: default_root_namespace(),
            request_timeout_seconds: default_request_timeout_seconds(),
            container_registry_secret_names: Vec::new(),
        }
    }
}

impl ApiConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))
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
        if self.request_timeout_seconds == 0 {
            anyhow::bail!("requestTimeoutSeconds must be greater than zero");
        }
        for name in &self.container_registry_secret_names {
            if !is_valid_name(name) {
                anyhow::bail!("containerRegistrySecretNames: '{}' is not a valid secret name", name);
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}
