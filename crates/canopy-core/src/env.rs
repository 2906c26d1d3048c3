//! Environment variable expansion for configuration files

use regex::{Captures, Regex};
use std::sync::LazyLock;

static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Expand `${VAR}` and `${VAR:-default}`; unset variables without a default
/// expand to the empty string
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .to_string()
}
