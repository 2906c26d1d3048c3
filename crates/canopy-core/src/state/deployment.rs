//! Deployments
//!
//! There is no deployment resource. Deploying an app assigns the droplet,
//! bumps the `canopy.io/app-rev` annotation and starts the app in a single
//! write; the deployment is finished once the app is ready at that revision.

use crate::conditions::{is_condition_true, Conditioned, READY};
use crate::crd::{CanopyApp, DesiredState, NamedRef};
use crate::error::{Error, Result};
use crate::labels::APP_REVISION_ANNOTATION;
use kube::ResourceExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatusValue {
    Active,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatusReason {
    Deploying,
    Deployed,
}

impl DeploymentStatusValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatusValue::Active => "ACTIVE",
            DeploymentStatusValue::Finalized => "FINALIZED",
        }
    }
}

impl DeploymentStatusReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatusReason::Deploying => "DEPLOYING",
            DeploymentStatusReason::Deployed => "DEPLOYED",
        }
    }
}

/// Numeric value of the revision annotation; absent means 0
pub fn revision_of(app: &CanopyApp) -> Result<u64> {
    match app.revision() {
        None => Ok(0),
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            Error::InvalidState(format!(
                "expected {APP_REVISION_ANNOTATION} of app {} to be an integer, got {raw:?}",
                app.name_any()
            ))
        }),
    }
}

/// The app as it must be written to start a new deployment
///
/// The droplet is `droplet_override` when given, else the app's current one.
/// The returned object keeps the input's resource version, so writing it is
/// rejected if the app changed since it was read.
pub fn bump_revision(app: &CanopyApp, droplet_override: Option<&str>) -> Result<CanopyApp> {
    let droplet = droplet_override
        .filter(|d| !d.is_empty())
        .or_else(|| app.current_droplet())
        .ok_or_else(|| {
            Error::InvalidState(format!("app {} has no droplet to deploy", app.name_any()))
        })?
        .to_string();
    let next = revision_of(app)?.checked_add(1).ok_or_else(|| {
        Error::InvalidState(format!("revision of app {} is exhausted", app.name_any()))
    })?;

    let mut updated = app.clone();
    updated.spec.current_droplet_ref = Some(NamedRef::new(droplet));
    updated.spec.desired_state = DesiredState::Started;
    updated
        .annotations_mut()
        .insert(APP_REVISION_ANNOTATION.to_string(), next.to_string());
    Ok(updated)
}

/// Deployment status derived from the app
pub fn deployment_status(app: &CanopyApp) -> (DeploymentStatusValue, DeploymentStatusReason) {
    let revision = revision_of(app).ok().map(|r| r.to_string());
    let at_revision = app
        .status
        .as_ref()
        .and_then(|s| s.observed_revision.clone())
        .is_some_and(|observed| Some(observed) == revision);

    if is_condition_true(app.conditions(), READY) && at_revision {
        (DeploymentStatusValue::Finalized, DeploymentStatusReason::Deployed)
    } else {
        (DeploymentStatusValue::Active, DeploymentStatusReason::Deploying)
    }
}
