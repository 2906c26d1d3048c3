//! Repositories behind the synchronous API
//!
//! Each repository call takes the caller's [`RequestContext`], acts through a
//! store impersonating the caller, and returns a fully resolved record. Calls
//! that create or change an object wait, within the request deadline, for the
//! controllers to report the condition that makes the record meaningful.
//!
//! [`RequestContext`]: canopy_core::identity::RequestContext

pub mod app;
pub mod build;
pub mod deployment;
pub mod namespace_retriever;
pub mod org;
pub mod service_binding;
pub mod space;
pub mod task;

use canopy_core::conditions::Conditioned;
use canopy_core::error::Error;
use chrono::{DateTime, Utc};
use kube::Resource;

/// A fresh object GUID, also used as `metadata.name`
pub(crate) fn new_guid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Name a `NotFound` after the API resource instead of the store kind
pub(crate) fn for_resource(err: Error, resource: &str) -> Error {
    match err {
        Error::NotFound {
            name, namespace, ..
        } => Error::NotFound {
            kind: resource.to_string(),
            name,
            namespace,
        },
        other => other,
    }
}

pub(crate) fn created_at<K: Resource>(obj: &K) -> Option<DateTime<Utc>> {
    obj.meta().creation_timestamp.as_ref().map(|t| t.0)
}

/// Latest condition transition, or the creation time before any status
pub(crate) fn updated_at<K: Resource + Conditioned>(obj: &K) -> Option<DateTime<Utc>> {
    obj.conditions()
        .iter()
        .filter_map(|c| DateTime::parse_from_rfc3339(&c.last_transition_time).ok())
        .map(|t| t.with_timezone(&Utc))
        .max()
        .or_else(|| created_at(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_resource_renames_not_found() {
        let err = for_resource(Error::not_found("CanopyTask", "space-1", "t-1"), "Task");
        assert_eq!(err.to_string(), "Task not found: t-1 in namespace space-1");

        let err = for_resource(Error::Forbidden("nope".to_string()), "Task");
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_guids_are_unique() {
        assert_ne!(new_guid(), new_guid());
    }
}
