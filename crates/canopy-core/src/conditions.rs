//! Condition model
//!
//! Every Canopy resource reports convergence through an ordered set of named
//! conditions. The set is keyed by condition type; a condition keeps its
//! position from the first time it was set, and its transition time only moves
//! when its status actually changes.

use chrono::{DateTime, SecondsFormat, Utc};
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const READY: &str = "Ready";

/// Tri-state value of a condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A named observation about a resource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, unique within a resource
    pub r#type: String,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine-readable reason in CamelCase
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Spec generation this condition was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the status changed (RFC 3339)
    pub last_transition_time: String,
}

impl Condition {
    pub fn new(
        r#type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        observed_generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            r#type: r#type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation,
            last_transition_time: format_time(now),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Format a timestamp the way the API server stores `metav1.Time`
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Set or update a condition in place.
///
/// An existing condition of the same type keeps its position; its
/// `last_transition_time` is replaced only when the status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => conditions.push(new),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

pub fn remove_condition(conditions: &mut Vec<Condition>, r#type: &str) {
    conditions.retain(|c| c.r#type != r#type);
}

pub fn is_condition_true(conditions: &[Condition], r#type: &str) -> bool {
    find_condition(conditions, r#type).is_some_and(Condition::is_true)
}

/// Status of a condition, `Unknown` when it has never been set
pub fn condition_status(conditions: &[Condition], r#type: &str) -> ConditionStatus {
    find_condition(conditions, r#type)
        .map(|c| c.status)
        .unwrap_or_default()
}

/// Resources that report convergence through conditions
pub trait Conditioned {
    fn conditions(&self) -> &[Condition];

    /// `status.observedGeneration`, if a status was ever written
    fn observed_generation(&self) -> Option<i64>;

    fn condition(&self, r#type: &str) -> Option<&Condition> {
        find_condition(self.conditions(), r#type)
    }
}

/// True when the object's spec generation is behind the generation its status
/// was computed from, i.e. the object is a stale read.
pub fn is_stale<K: Resource + Conditioned>(obj: &K) -> bool {
    match (obj.meta().generation, obj.observed_generation()) {
        (Some(generation), Some(observed)) => generation < observed,
        _ => false,
    }
}

/// True when `r#type` has reached `desired` for the object's current generation.
///
/// A condition that records an observed generation only counts once that
/// generation matches the object's, so status left over from an older spec
/// is never mistaken for convergence.
pub fn condition_reached<K: Resource + Conditioned>(
    obj: &K,
    r#type: &str,
    desired: ConditionStatus,
) -> bool {
    let Some(condition) = obj.condition(r#type) else {
        return false;
    };
    if condition.status != desired {
        return false;
    }
    match (condition.observed_generation, obj.meta().generation) {
        (Some(observed), Some(generation)) => observed == generation,
        _ => true,
    }
}
