//! Blocking wait for a resource condition
//!
//! Every await starts from a read (or from the snapshot a write returned) and
//! watches from that snapshot's resource version, so a transition that lands
//! between the read and the watch is replayed rather than lost. Each event is
//! judged against the full object it carries. A watch that fails with a
//! retryable error is re-established after a backoff. The deadline is the only
//! way an await ends without an answer.

use canopy_core::conditions::{condition_reached, ConditionStatus, Conditioned};
use canopy_core::error::{Error, Result};
use canopy_core::identity::Deadline;
use canopy_core::retry::RetryPolicy;
use canopy_core::store::{ListOptions, Store, StoreEvent, StoreObject};
use futures::StreamExt;
use kube::ResourceExt;
use std::future::Future;
use tracing::{debug, warn};

/// The condition state an await is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Awaited<'a> {
    pub condition: &'a str,
    pub status: ConditionStatus,
}

impl<'a> Awaited<'a> {
    pub fn new(condition: &'a str, status: ConditionStatus) -> Self {
        Self { condition, status }
    }

    pub fn is_true(condition: &'a str) -> Self {
        Self::new(condition, ConditionStatus::True)
    }

    fn reached_by<K: StoreObject + Conditioned>(&self, obj: &K) -> bool {
        condition_reached(obj, self.condition, self.status)
    }

    fn timeout(&self, target: String) -> Error {
        Error::Timeout {
            target,
            condition: self.condition.to_string(),
            status: self.status.as_str().to_string(),
        }
    }
}

/// How a watch ended without reaching the condition
enum Interrupted {
    Deleted,
    /// Stream ended or its origin expired; start over from a fresh read
    Restart,
    /// Watch could not be opened or broke with a retryable error
    Failed(Error),
}

/// Waits for conditions on objects visible through one store client
#[derive(Clone)]
pub struct ConditionAwaiter<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: Store> ConditionAwaiter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff between re-established watches after failures
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sleep before re-establishing a failed watch
    async fn back_off(&self, failures: &mut u32, target: &str, error: &Error) {
        let delay = self.retry.delay(*failures);
        *failures = failures.saturating_add(1);
        warn!(
            target = %target,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Watch failed, retrying after backoff"
        );
        tokio::time::sleep(delay).await;
    }

    /// Wait until `namespace/name` reports `awaited`
    ///
    /// Returns without opening a watch when the first read already satisfies
    /// the condition. Fails with `NotFound` if the object is absent or gets
    /// deleted first, and with `Timeout` once `deadline` passes.
    pub async fn await_condition<K>(
        &self,
        deadline: Deadline,
        namespace: &str,
        name: &str,
        awaited: Awaited<'_>,
    ) -> Result<K>
    where
        K: StoreObject + Conditioned,
    {
        let target = describe::<K>(namespace, name);
        bounded(deadline, &target, awaited, self.follow(namespace, name, None, awaited)).await
    }

    /// Wait for `awaited` on an object the caller just wrote
    ///
    /// The watch starts at the resource version of `written`, so nothing the
    /// controllers did after the write can be missed.
    pub async fn await_after_write<K>(
        &self,
        deadline: Deadline,
        namespace: &str,
        written: K,
        awaited: Awaited<'_>,
    ) -> Result<K>
    where
        K: StoreObject + Conditioned,
    {
        let name = written.name_any();
        let target = describe::<K>(namespace, &name);
        bounded(
            deadline,
            &target,
            awaited,
            self.follow(namespace, &name, Some(written), awaited),
        )
        .await
    }

    /// Wait until some object selected by `options` and `predicate` reports
    /// `awaited`
    ///
    /// Objects that do not exist yet are waited for; deletions are ignored.
    pub async fn await_in_list<K, P>(
        &self,
        deadline: Deadline,
        namespace: &str,
        options: &ListOptions,
        predicate: P,
        awaited: Awaited<'_>,
    ) -> Result<K>
    where
        K: StoreObject + Conditioned,
        P: Fn(&K) -> bool + Send + Sync,
    {
        let target = format!("{} in namespace {}", K::kind_name(), namespace);
        let wait = self.scan(namespace, options, &predicate, awaited, &target);
        bounded(deadline, &target, awaited, wait).await
    }

    async fn scan<K, P>(
        &self,
        namespace: &str,
        options: &ListOptions,
        predicate: &P,
        awaited: Awaited<'_>,
        target: &str,
    ) -> Result<K>
    where
        K: StoreObject + Conditioned,
        P: Fn(&K) -> bool + Send + Sync,
    {
        let mut failures = 0;
        loop {
            let list = self.store.list::<K>(namespace, options).await?;
            if let Some(found) = list
                .items
                .into_iter()
                .find(|obj| predicate(obj) && awaited.reached_by(obj))
            {
                return Ok(found);
            }

            let mut events = match self
                .store
                .watch::<K>(namespace, options, &list.resource_version)
                .await
            {
                Ok(events) => events,
                Err(e) if e.is_retryable() => {
                    self.back_off(&mut failures, target, &e).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            loop {
                match events.next().await {
                    Some(Ok(StoreEvent::Applied(obj)))
                        if predicate(&obj) && awaited.reached_by(&obj) =>
                    {
                        return Ok(obj);
                    }
                    Some(Ok(StoreEvent::Applied(_) | StoreEvent::Deleted(_))) => failures = 0,
                    Some(Ok(StoreEvent::Expired)) | None => break,
                    Some(Err(e)) if e.is_retryable() => {
                        self.back_off(&mut failures, target, &e).await;
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                }
            }
            debug!(target = %target, "Re-establishing list watch");
        }
    }

    async fn follow<K>(
        &self,
        namespace: &str,
        name: &str,
        mut snapshot: Option<K>,
        awaited: Awaited<'_>,
    ) -> Result<K>
    where
        K: StoreObject + Conditioned,
    {
        let selector = ListOptions::fields(format!("metadata.name={name}"));
        let target = describe::<K>(namespace, name);
        let mut failures = 0;
        loop {
            let current = match snapshot.take() {
                Some(obj) => obj,
                None => self.store.get::<K>(namespace, name).await?,
            };
            if awaited.reached_by(&current) {
                return Ok(current);
            }

            let origin = current.resource_version().unwrap_or_default();
            match self.watch_once(namespace, &selector, &origin, awaited).await? {
                Ok(reached) => return Ok(reached),
                Err(Interrupted::Deleted) => {
                    return Err(Error::not_found(&K::kind_name(), namespace, name));
                }
                Err(Interrupted::Restart) => {
                    failures = 0;
                    debug!(name = %name, namespace = %namespace, "Re-establishing watch");
                }
                Err(Interrupted::Failed(e)) => self.back_off(&mut failures, &target, &e).await,
            }
        }
    }

    async fn watch_once<K>(
        &self,
        namespace: &str,
        selector: &ListOptions,
        origin: &str,
        awaited: Awaited<'_>,
    ) -> Result<std::result::Result<K, Interrupted>>
    where
        K: StoreObject + Conditioned,
    {
        let mut events = match self.store.watch::<K>(namespace, selector, origin).await {
            Ok(events) => events,
            Err(e) if e.is_retryable() => return Ok(Err(Interrupted::Failed(e))),
            Err(e) => return Err(e),
        };
        while let Some(event) = events.next().await {
            match event {
                Ok(StoreEvent::Applied(obj)) if awaited.reached_by(&obj) => return Ok(Ok(obj)),
                Ok(StoreEvent::Applied(_)) => {}
                Ok(StoreEvent::Deleted(_)) => return Ok(Err(Interrupted::Deleted)),
                Ok(StoreEvent::Expired) => return Ok(Err(Interrupted::Restart)),
                Err(e) if e.is_retryable() => return Ok(Err(Interrupted::Failed(e))),
                Err(e) => return Err(e),
            }
        }
        Ok(Err(Interrupted::Restart))
    }
}

fn describe<K: StoreObject>(namespace: &str, name: &str) -> String {
    format!("{} {}/{}", K::kind_name(), namespace, name)
}

async fn bounded<K>(
    deadline: Deadline,
    target: &str,
    awaited: Awaited<'_>,
    wait: impl Future<Output = Result<K>>,
) -> Result<K> {
    match tokio::time::timeout_at(deadline.instant(), wait).await {
        Ok(result) => result,
        Err(_) => {
            debug!(target = %target, condition = %awaited.condition, "Await timed out");
            Err(awaited.timeout(target.to_string()))
        }
    }
}
