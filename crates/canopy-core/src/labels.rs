//! Well-known label and annotation keys, and helpers for label maps

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

pub const APP_GUID_LABEL: &str = "canopy.io/app-guid";
pub const BUILD_GUID_LABEL: &str = "canopy.io/build-guid";
pub const TASK_GUID_LABEL: &str = "canopy.io/task-guid";
pub const ORG_GUID_LABEL: &str = "canopy.io/org-guid";
pub const SPACE_GUID_LABEL: &str = "canopy.io/space-guid";
pub const ORG_NAMESPACE_LABEL: &str = "canopy.io/org-namespace";
pub const PROPAGATED_FROM_LABEL: &str = "canopy.io/propagated-from";

pub const APP_REVISION_ANNOTATION: &str = "canopy.io/app-rev";
pub const TASK_SEQUENCE_ANNOTATION: &str = "canopy.io/task-sequence-id";
pub const PROPAGATE_ROLE_BINDING_ANNOTATION: &str = "canopy.io/propagate-role-binding";
pub const PROPAGATE_DELETION_ANNOTATION: &str = "canopy.io/propagate-deletion";

pub const POD_SECURITY_ENFORCE_LABEL: &str = "pod-security.kubernetes.io/enforce";
pub const POD_SECURITY_AUDIT_LABEL: &str = "pod-security.kubernetes.io/audit";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_CANOPY: &str = "canopy";

/// Key prefixes written by package managers that must not leak into
/// tenant-visible copies
const PACKAGE_MANAGER_KEY_PREFIXES: &[&str] = &["kapp.k14s.io/", "meta.helm.sh/"];

/// RFC 1123 label, used for object names and namespace names
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Name part of a qualified label/annotation key
static QUALIFIED_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap());

/// DNS subdomain, used for key prefixes
static SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Copy a label or annotation map without package-manager bookkeeping keys
pub fn strip_package_manager_keys(
    values: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let values = values?;
    let stripped: BTreeMap<String, String> = values
        .iter()
        .filter(|(key, _)| {
            let bookkeeping = PACKAGE_MANAGER_KEY_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix));
            if bookkeeping {
                debug!(key = %key, "Dropping package manager key");
            }
            !bookkeeping
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(stripped)
}

/// Merge `values` into `dest`, leaving keys not named in `values` untouched
pub fn merge_into(dest: &mut Option<BTreeMap<String, String>>, values: &BTreeMap<String, String>) {
    let map = dest.get_or_insert_with(BTreeMap::new);
    for (key, value) in values {
        map.insert(key.clone(), value.clone());
    }
}

/// True when every entry of `values` is already present in `current`
pub fn contains_all(current: Option<&BTreeMap<String, String>>, values: &BTreeMap<String, String>) -> bool {
    values
        .iter()
        .all(|(k, v)| current.and_then(|m| m.get(k)) == Some(v))
}

/// Render an equality label selector (`a=b,c=d`)
pub fn selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn is_valid_name(value: &str) -> bool {
    !value.is_empty() && value.len() <= 63 && NAME_REGEX.is_match(value)
}

/// Validate a label or annotation key (`[prefix/]name`)
pub fn validate_qualified_key(key: &str) -> std::result::Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !SUBDOMAIN_REGEX.is_match(prefix) {
            return Err(format!(
                "{key:?}: prefix part must be a lowercase RFC 1123 subdomain"
            ));
        }
    }

    if name.is_empty() || name.len() > 63 {
        return Err(format!("{key:?}: name part must be 1-63 characters"));
    }

    if !QUALIFIED_NAME_REGEX.is_match(name) {
        return Err(format!(
            "{key:?}: name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
        ));
    }

    Ok(())
}
