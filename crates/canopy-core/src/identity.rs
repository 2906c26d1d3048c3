//! Caller identity and request deadlines
//!
//! Both are passed explicitly to every repository and store call; there is no
//! ambient or task-local identity.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// The authenticated caller a store client acts on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// User or service-account name
    pub name: String,
    /// Groups the caller belongs to
    pub groups: Vec<String>,
}

impl Identity {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Point in time after which a blocking operation must give up
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// Per-request context supplied by the API layer
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Identity,
    pub deadline: Deadline,
}

impl RequestContext {
    pub fn new(identity: Identity, timeout: Duration) -> Self {
        Self {
            identity,
            deadline: Deadline::after(timeout),
        }
    }
}
