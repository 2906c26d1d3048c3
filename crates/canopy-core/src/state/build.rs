//! Build state machine
//!
//! A build waits for its app and package to resolve, then mirrors the build
//! service's `Succeeded` condition:
//!
//! | workload `Succeeded` | `Staging`               | `Succeeded`             |
//! |----------------------|-------------------------|-------------------------|
//! | absent / Unknown     | True, `BuildRunning`    | Unknown                 |
//! | False                | False, `BuildNotRunning`| False, `BuildFailed`    |
//! | True                 | False, `BuildNotRunning`| True, `BuildSucceeded`  |
//!
//! Once `Succeeded` is True or False the build is frozen.

use super::Transition;
use crate::conditions::{
    condition_status, find_condition, is_stale, set_condition, Condition, ConditionStatus,
    Conditioned,
};
use crate::crd::{
    BuildStatus, BuildWorkload, CanopyApp, CanopyBuild, CanopyPackage, DropletStatus, ProcessType,
    BUILD_STAGING, BUILD_SUCCEEDED, REFERENCES_RESOLVED,
};
use chrono::{DateTime, Utc};

pub const REASON_BUILD_RUNNING: &str = "BuildRunning";
pub const REASON_BUILD_NOT_RUNNING: &str = "BuildNotRunning";
pub const REASON_BUILD_SUCCEEDED: &str = "BuildSucceeded";
pub const REASON_BUILD_FAILED: &str = "BuildFailed";

/// Process types and ports read from a built image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub process_types: Vec<ProcessType>,
    pub ports: Vec<i32>,
}

/// Objects a build refers to, as observed by the driver
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildObservation<'a> {
    pub app: Option<&'a CanopyApp>,
    pub package: Option<&'a CanopyPackage>,
    pub workload: Option<&'a BuildWorkload>,
    /// Present once the driver inspected the image of a succeeded workload
    pub image: Option<&'a ImageConfig>,
}

/// Externally visible build state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Staging,
    Staged,
    Failed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Staging => "STAGING",
            BuildState::Staged => "STAGED",
            BuildState::Failed => "FAILED",
        }
    }
}

pub fn build_state(build: &CanopyBuild) -> BuildState {
    match condition_status(build.conditions(), BUILD_SUCCEEDED) {
        ConditionStatus::True => BuildState::Staged,
        ConditionStatus::False => BuildState::Failed,
        ConditionStatus::Unknown => BuildState::Staging,
    }
}

/// True once the build reached a terminal `Succeeded` value
pub fn is_finished(build: &CanopyBuild) -> bool {
    build_state(build) != BuildState::Staging
}

pub fn next_build_status(
    build: &CanopyBuild,
    observed: &BuildObservation<'_>,
    now: DateTime<Utc>,
) -> Transition<BuildStatus> {
    if is_stale(build) || is_finished(build) {
        return Transition::NoOp;
    }

    let generation = build.metadata.generation;
    let mut status = build.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();
    let mut droplet_update = None;
    let mut set = |r#type: &str, value: ConditionStatus, reason: &str, message: String| {
        set_condition(
            &mut status.conditions,
            Condition::new(r#type, value, reason, message, generation, now),
        );
    };

    let missing = if observed.app.is_none() {
        Some(("AppNotFound", format!("app {} not found", build.spec.app_ref.name)))
    } else if observed.package.is_none() {
        Some((
            "PackageNotFound",
            format!("package {} not found", build.spec.package_ref.name),
        ))
    } else {
        None
    };
    if let Some((reason, message)) = missing {
        set(REFERENCES_RESOLVED, ConditionStatus::False, reason, message);
        return Transition::changed(build.status.as_ref(), status);
    }
    set(
        REFERENCES_RESOLVED,
        ConditionStatus::True,
        "ReferencesResolved",
        String::new(),
    );

    let workload_succeeded = observed
        .workload
        .and_then(|w| find_condition(w.conditions(), BUILD_SUCCEEDED));

    match workload_succeeded.map(|c| c.status) {
        None | Some(ConditionStatus::Unknown) => {
            set(BUILD_STAGING, ConditionStatus::True, REASON_BUILD_RUNNING, String::new());
            set(BUILD_SUCCEEDED, ConditionStatus::Unknown, "Unknown", String::new());
        }
        Some(ConditionStatus::False) => {
            let message = workload_succeeded
                .map(|c| c.message.clone())
                .unwrap_or_default();
            set(BUILD_STAGING, ConditionStatus::False, REASON_BUILD_NOT_RUNNING, String::new());
            set(BUILD_SUCCEEDED, ConditionStatus::False, REASON_BUILD_FAILED, message);
        }
        Some(ConditionStatus::True) => {
            let droplet = observed
                .workload
                .and_then(|w| w.status.as_ref())
                .and_then(|s| s.droplet.as_ref());
            match (droplet, observed.image) {
                (Some(droplet), Some(image)) => {
                    droplet_update = Some(DropletStatus {
                        registry: droplet.registry.clone(),
                        stack: droplet.stack.clone(),
                        process_types: image.process_types.clone(),
                        ports: image.ports.clone(),
                    });
                    set(BUILD_STAGING, ConditionStatus::False, REASON_BUILD_NOT_RUNNING, String::new());
                    set(BUILD_SUCCEEDED, ConditionStatus::True, REASON_BUILD_SUCCEEDED, String::new());
                }
                (None, _) => {
                    set(BUILD_STAGING, ConditionStatus::False, REASON_BUILD_NOT_RUNNING, String::new());
                    set(
                        BUILD_SUCCEEDED,
                        ConditionStatus::False,
                        REASON_BUILD_FAILED,
                        "build workload succeeded without reporting a droplet".to_string(),
                    );
                }
                // Image not inspected yet; keep staging
                (Some(_), None) => {
                    set(BUILD_STAGING, ConditionStatus::True, REASON_BUILD_RUNNING, String::new());
                    set(BUILD_SUCCEEDED, ConditionStatus::Unknown, "Unknown", String::new());
                }
            }
        }
    }

    if droplet_update.is_some() {
        status.droplet = droplet_update;
    }
    Transition::changed(build.status.as_ref(), status)
}
