//! App readiness
//!
//! An app is only as ready as the runner workload serving its current
//! revision. Until the workload reports that revision, the app is `Starting`.

use super::deployment::revision_of;
use super::Transition;
use crate::conditions::{find_condition, is_stale, set_condition, Condition, ConditionStatus, Conditioned, READY};
use crate::crd::{AppStatus, AppWorkload, CanopyApp, DesiredState};
use chrono::{DateTime, Utc};

pub const REASON_DROPLET_NOT_ASSIGNED: &str = "DropletNotAssigned";
pub const REASON_STOPPED: &str = "Stopped";
pub const REASON_STARTING: &str = "Starting";
pub const REASON_RUNNING: &str = "Running";
pub const REASON_INVALID_REVISION: &str = "InvalidRevision";
pub const REASON_DROPLET_NOT_FOUND: &str = "DropletNotFound";

pub fn next_app_status(
    app: &CanopyApp,
    workload: Option<&AppWorkload>,
    now: DateTime<Utc>,
) -> Transition<AppStatus> {
    if is_stale(app) {
        return Transition::NoOp;
    }

    let generation = app.metadata.generation;
    let mut status = app.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();

    let revision = revision_of(app).ok().map(|r| r.to_string());
    let reported = workload
        .and_then(|w| w.status.as_ref())
        .and_then(|s| s.observed_revision.clone());
    status.observed_revision = reported.clone();

    let (value, reason, message) = if app.current_droplet().is_none() {
        (
            ConditionStatus::False,
            REASON_DROPLET_NOT_ASSIGNED.to_string(),
            "app has no current droplet".to_string(),
        )
    } else if app.spec.desired_state == DesiredState::Stopped {
        (ConditionStatus::False, REASON_STOPPED.to_string(), String::new())
    } else if reported.is_none() || reported != revision {
        (ConditionStatus::Unknown, REASON_STARTING.to_string(), String::new())
    } else {
        match workload.and_then(|w| find_condition(w.conditions(), READY)) {
            Some(ready) if ready.is_true() => {
                (ConditionStatus::True, REASON_RUNNING.to_string(), String::new())
            }
            Some(ready) if ready.status == ConditionStatus::False => {
                (ConditionStatus::False, ready.reason.clone(), ready.message.clone())
            }
            _ => (ConditionStatus::Unknown, REASON_STARTING.to_string(), String::new()),
        }
    };

    set_condition(
        &mut status.conditions,
        Condition::new(READY, value, &reason, message, generation, now),
    );
    Transition::changed(app.status.as_ref(), status)
}
