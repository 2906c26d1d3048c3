//! Reconciliation state machines
//!
//! One pure transition function per workload kind. Each takes the observed
//! object, the objects it directly references and a timestamp supplied by the
//! driver, and computes the object's next status. Cross-object effects
//! (creating workloads, assigning droplets, allocating sequence ids) belong to
//! the controllers.
//!
//! Every function is deterministic and fenced on generation: an object whose
//! `metadata.generation` is behind its `status.observedGeneration` is a stale
//! read and yields [`Transition::NoOp`].

pub mod app;
pub mod build;
pub mod deployment;
pub mod service_binding;
pub mod task;
pub mod tenant;

/// Outcome of a transition function
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<S> {
    /// Nothing to write
    NoOp,
    /// Write this status
    Update(S),
}

impl<S: PartialEq> Transition<S> {
    /// `Update(next)` unless `next` is what the object already reports
    pub fn changed(current: Option<&S>, next: S) -> Self {
        if current == Some(&next) {
            Transition::NoOp
        } else {
            Transition::Update(next)
        }
    }
}

impl<S> Transition<S> {
    pub fn is_noop(&self) -> bool {
        matches!(self, Transition::NoOp)
    }

    pub fn into_update(self) -> Option<S> {
        match self {
            Transition::NoOp => None,
            Transition::Update(status) => Some(status),
        }
    }
}
