//! Org and space readiness
//!
//! Orgs and spaces are ready once their namespace exists and the parent's
//! secrets and role bindings have been propagated into it.

use super::Transition;
use crate::conditions::{is_stale, set_condition, Condition, ConditionStatus, Conditioned, READY};
use crate::crd::{CanopyOrg, CanopySpace, TenantStatus};
use crate::labels::{ORG_GUID_LABEL, ORG_NAMESPACE_LABEL, SPACE_GUID_LABEL};
use crate::store::StoreObject;
use chrono::{DateTime, Utc};
use kube::Resource;
use std::fmt;

/// Shared view of orgs and spaces
pub trait Tenant: StoreObject + Conditioned {
    /// Label carrying the tenant GUID on its namespace
    const GUID_LABEL: &'static str;
    /// Label naming the parent namespace on the tenant's namespace, if any
    const PARENT_LABEL: Option<&'static str>;
    const FINALIZER: &'static str;

    fn display_name(&self) -> &str;
    fn tenant_status(&self) -> Option<&TenantStatus>;
    fn set_tenant_status(&mut self, status: TenantStatus);
}

macro_rules! tenant {
    ($($kind:ty => ($label:expr, $parent:expr, $finalizer:expr)),*) => {
        $(
            impl Tenant for $kind {
                const GUID_LABEL: &'static str = $label;
                const PARENT_LABEL: Option<&'static str> = $parent;
                const FINALIZER: &'static str = $finalizer;

                fn display_name(&self) -> &str {
                    &self.spec.display_name
                }

                fn tenant_status(&self) -> Option<&TenantStatus> {
                    self.status.as_ref()
                }

                fn set_tenant_status(&mut self, status: TenantStatus) {
                    self.status = Some(status);
                }
            }
        )*
    };
}

tenant!(
    CanopyOrg => (ORG_GUID_LABEL, None, "canopy.io/delete-org"),
    CanopySpace => (SPACE_GUID_LABEL, Some(ORG_NAMESPACE_LABEL), "canopy.io/delete-space")
);

/// Step of tenant setup that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantFailure {
    NamespaceCreation(String),
    SecretPropagation(String),
    RoleBindingPropagation(String),
}

impl TenantFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            TenantFailure::NamespaceCreation(_) => "NamespaceCreation",
            TenantFailure::SecretPropagation(_) => "SecretPropagation",
            TenantFailure::RoleBindingPropagation(_) => "RoleBindingPropagation",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TenantFailure::NamespaceCreation(m)
            | TenantFailure::SecretPropagation(m)
            | TenantFailure::RoleBindingPropagation(m) => m,
        }
    }
}

impl fmt::Display for TenantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason(), self.message())
    }
}

/// Status after an attempt to set up the tenant's `namespace`
pub fn next_tenant_status<T: Tenant>(
    tenant: &T,
    namespace: &str,
    outcome: Result<(), &TenantFailure>,
    now: DateTime<Utc>,
) -> Transition<TenantStatus> {
    if is_stale(tenant) {
        return Transition::NoOp;
    }

    let generation = tenant.meta().generation;
    let mut status = tenant.tenant_status().cloned().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();

    let ready = match outcome {
        Ok(()) => {
            status.guid = namespace.to_string();
            Condition::new(READY, ConditionStatus::True, "Ready", "", generation, now)
        }
        Err(failure) => Condition::new(
            READY,
            ConditionStatus::False,
            failure.reason(),
            failure.message(),
            generation,
            now,
        ),
    };
    set_condition(&mut status.conditions, ready);

    Transition::changed(tenant.tenant_status(), status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::find_condition;
    use crate::crd::CanopySpaceSpec;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn space() -> CanopySpace {
        let mut space = CanopySpace::new(
            "space-1",
            CanopySpaceSpec {
                display_name: "staging".to_string(),
            },
        );
        space.metadata.generation = Some(1);
        space
    }

    #[test]
    fn test_ready_sets_guid() {
        let status = next_tenant_status(&space(), "space-1", Ok(()), now())
            .into_update()
            .unwrap();
        assert_eq!(status.guid, "space-1");
        assert!(find_condition(&status.conditions, READY).unwrap().is_true());
    }

    #[test]
    fn test_failure_reason() {
        let failure = TenantFailure::SecretPropagation("Secret not found: creds".to_string());
        let status = next_tenant_status(&space(), "space-1", Err(&failure), now())
            .into_update()
            .unwrap();
        let ready = find_condition(&status.conditions, READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "SecretPropagation");
        assert!(ready.message.contains("creds"));
        assert!(status.guid.is_empty());
    }

    #[test]
    fn test_idempotent() {
        let mut space = space();
        let status = next_tenant_status(&space, "space-1", Ok(()), now())
            .into_update()
            .unwrap();
        space.set_tenant_status(status);
        assert!(next_tenant_status(&space, "space-1", Ok(()), now()).is_noop());
        assert_eq!(space.display_name(), "staging");
        assert_eq!(CanopySpace::GUID_LABEL, SPACE_GUID_LABEL);
    }
}
