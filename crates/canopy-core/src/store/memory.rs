//! In-process store with API-server semantics
//!
//! Objects are kept as JSON documents keyed by kind, namespace and name. A
//! single revision counter orders every change; each change is appended to an
//! bounded event log and broadcast to open watches, so a watch opened from a
//! retained resource version replays what it missed before following live
//! changes. A watch from a version older than the log reports it as expired.
//!
//! Beyond the API-server behaviour (resource versions, generations, status
//! subresource, finalizers, namespace cascade) the store can deny an identity
//! access to a namespace, inject failures, force open watches to expire and
//! report how many watches were opened.

use super::{ListOptions, ObjectList, Store, StoreEvent, StoreFactory, StoreObject};
use crate::conditions::format_time;
use crate::error::{Error, Result};
use crate::identity::Identity;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 1024;
const EVENT_LOG_RETAINED: usize = 1024;

/// Store operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

/// Error returned by an injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedError {
    Conflict,
    Transient,
    Forbidden,
}

impl InjectedError {
    fn into_error(self, verb: Verb, kind: &str, name: &str) -> Error {
        let message = format!("injected failure: {verb:?} {kind} {name}");
        match self {
            InjectedError::Conflict => Error::Conflict(message),
            InjectedError::Transient => Error::Transient(message),
            InjectedError::Forbidden => Error::Forbidden(message),
        }
    }
}

type Key = (String, String, String);

#[derive(Debug, Clone)]
struct LoggedEvent {
    revision: u64,
    kind: String,
    namespace: String,
    deleted: bool,
    object: Value,
}

#[derive(Debug, Clone)]
enum Signal {
    Event(LoggedEvent),
    Expire,
}

struct FailureRule {
    verb: Verb,
    kind: String,
    name: Option<String>,
    remaining: usize,
    error: InjectedError,
}

#[derive(Default)]
struct State {
    revision: u64,
    objects: BTreeMap<Key, Value>,
    log: VecDeque<LoggedEvent>,
    /// Newest revision dropped from the log
    compacted: u64,
    denials: Vec<(String, String)>,
    failures: Vec<FailureRule>,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<Signal>,
    watches_opened: AtomicUsize,
    retained: usize,
}

/// In-memory [`Store`]; clones share the same objects
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    identity: Option<Identity>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_retention(EVENT_LOG_RETAINED)
    }

    /// A store whose event log keeps only the last `retained` changes
    pub fn with_event_retention(retained: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                watches_opened: AtomicUsize::new(0),
                retained: retained.max(1),
            }),
            identity: None,
        }
    }

    /// A handle over the same objects acting as `identity`
    pub fn as_identity(&self, identity: &Identity) -> Self {
        Self {
            inner: self.inner.clone(),
            identity: Some(identity.clone()),
        }
    }

    /// Reject every call made as `identity` inside `namespace`
    pub fn deny(&self, identity: &str, namespace: &str) {
        self.lock()
            .denials
            .push((identity.to_string(), namespace.to_string()));
    }

    /// Fail the next `count` calls of `verb` on `kind` (optionally one name)
    pub fn inject_failure(
        &self,
        verb: Verb,
        kind: &str,
        name: Option<&str>,
        count: usize,
        error: InjectedError,
    ) {
        self.lock().failures.push(FailureRule {
            verb,
            kind: kind.to_string(),
            name: name.map(str::to_string),
            remaining: count,
            error,
        });
    }

    /// Tell every open watch that its origin expired
    pub fn expire_watches(&self) {
        let _guard = self.lock();
        let _ = self.inner.events.send(Signal::Expire);
    }

    /// Number of watches opened so far
    pub fn watches_opened(&self) -> usize {
        self.inner.watches_opened.load(Ordering::SeqCst)
    }

    /// Current revision of the whole store
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Every stored object of `K` in `namespace` (all namespaces when empty)
    pub fn objects<K: StoreObject>(&self, namespace: &str) -> Vec<K> {
        let kind = K::kind_name();
        self.lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || ns == namespace))
            .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, state: &mut State, verb: Verb, kind: &str, namespace: &str, name: &str) -> Result<()> {
        if let Some(identity) = &self.identity {
            let denied = state
                .denials
                .iter()
                .any(|(who, ns)| *who == identity.name && (ns == namespace || ns.is_empty()));
            if denied {
                return Err(Error::Forbidden(format!(
                    "{identity} cannot {verb:?} {kind} in namespace {namespace}"
                )));
            }
        }

        let rule = state.failures.iter_mut().find(|rule| {
            rule.remaining > 0
                && rule.verb == verb
                && rule.kind == kind
                && rule.name.as_deref().is_none_or(|n| n == name)
        });
        if let Some(rule) = rule {
            rule.remaining -= 1;
            return Err(rule.error.into_error(verb, kind, name));
        }
        Ok(())
    }

    fn record(&self, state: &mut State, kind: &str, namespace: &str, deleted: bool, object: Value) {
        let event = LoggedEvent {
            revision: state.revision,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            deleted,
            object,
        };
        state.log.push_back(event.clone());
        while state.log.len() > self.inner.retained {
            if let Some(dropped) = state.log.pop_front() {
                state.compacted = dropped.revision;
            }
        }
        let _ = self.inner.events.send(Signal::Event(event));
    }

    fn next_revision(state: &mut State) -> u64 {
        state.revision += 1;
        state.revision
    }

    fn remove(&self, state: &mut State, key: &Key) {
        if let Some(mut value) = state.objects.remove(key) {
            let revision = Self::next_revision(state);
            set_meta(&mut value, "resourceVersion", Value::String(revision.to_string()));
            self.record(state, &key.0, &key.1, true, value);
        }
    }

    /// Delete everything inside a removed namespace
    fn cascade(&self, state: &mut State, namespace: &str) {
        let keys: Vec<Key> = state
            .objects
            .keys()
            .filter(|(_, ns, _)| ns == namespace)
            .cloned()
            .collect();
        for key in keys {
            self.remove(state, &key);
        }
    }
}

fn scope<K: StoreObject>(namespace: &str) -> String {
    if K::NAMESPACED {
        namespace.to_string()
    } else {
        String::new()
    }
}

fn meta(value: &Value) -> Option<&Map<String, Value>> {
    value.get("metadata").and_then(Value::as_object)
}

fn meta_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    meta(value).and_then(|m| m.get(field)).and_then(Value::as_str)
}

fn set_meta(value: &mut Value, field: &str, new: Value) {
    if let Some(obj) = value.as_object_mut() {
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(m) = metadata.as_object_mut() {
            m.insert(field.to_string(), new);
        }
    }
}

fn has_finalizers(value: &Value) -> bool {
    meta(value)
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn labels_of(value: &Value) -> BTreeMap<String, String> {
    meta(value)
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn matches_labels(value: &Value, selector: &str) -> bool {
    let labels = labels_of(value);
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

fn matches_fields(value: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (field, expected, negate) = match term.split_once("!=") {
                Some((f, v)) => (f, v, true),
                None => match term.split_once("==").or_else(|| term.split_once('=')) {
                    Some((f, v)) => (f, v, false),
                    None => return false,
                },
            };
            let actual = match field.trim() {
                "metadata.name" => meta_str(value, "name").unwrap_or_default(),
                "metadata.namespace" => meta_str(value, "namespace").unwrap_or_default(),
                _ => return false,
            };
            (actual == expected.trim()) != negate
        })
}

fn matches(value: &Value, options: &ListOptions) -> bool {
    options
        .label_selector
        .as_deref()
        .is_none_or(|s| matches_labels(value, s))
        && options
            .field_selector
            .as_deref()
            .is_none_or(|s| matches_fields(value, s))
}

fn decode<K: StoreObject>(value: Value) -> Result<K> {
    Ok(serde_json::from_value(value)?)
}

fn parse_revision(resource_version: &str) -> Result<u64> {
    resource_version
        .parse()
        .map_err(|_| Error::Invalid(format!("invalid resource version {resource_version:?}")))
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K> {
        let kind = K::kind_name();
        let namespace = scope::<K>(namespace);
        let mut state = self.lock();
        self.check(&mut state, Verb::Get, &kind, &namespace, name)?;
        let key = (kind.clone(), namespace.clone(), name.to_string());
        match state.objects.get(&key) {
            Some(value) => decode(value.clone()),
            None => Err(Error::not_found(&kind, &namespace, name)),
        }
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        options: &ListOptions,
    ) -> Result<ObjectList<K>> {
        let kind = K::kind_name();
        let namespace = scope::<K>(namespace);
        let mut state = self.lock();
        self.check(&mut state, Verb::List, &kind, &namespace, "")?;
        let items = state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || *ns == namespace))
            .filter(|(_, value)| matches(value, options))
            .map(|(_, value)| decode(value.clone()))
            .collect::<Result<Vec<K>>>()?;
        Ok(ObjectList {
            items,
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch<K: StoreObject>(
        &self,
        namespace: &str,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<StoreEvent<K>>>> {
        let kind = K::kind_name();
        let namespace = scope::<K>(namespace);
        let options = options.clone();

        let (backlog, receiver, expired) = {
            let mut state = self.lock();
            self.check(&mut state, Verb::Watch, &kind, &namespace, "")?;
            let origin = if resource_version.is_empty() {
                state.revision
            } else {
                parse_revision(resource_version)?
            };
            // Subscribe under the lock so no change falls between the
            // replayed backlog and the live feed
            let receiver = self.inner.events.subscribe();
            let backlog: VecDeque<LoggedEvent> = state
                .log
                .iter()
                .filter(|event| event.revision > origin)
                .cloned()
                .collect();
            (backlog, receiver, origin < state.compacted)
        };
        self.inner.watches_opened.fetch_add(1, Ordering::SeqCst);
        debug!(kind = %kind, namespace = %namespace, resource_version = %resource_version, "Opening watch");

        if expired {
            debug!(kind = %kind, resource_version = %resource_version, "Watch origin is older than the event log");
            return Ok(stream::iter([Ok(StoreEvent::Expired)]).boxed());
        }

        let relevant = move |event: &LoggedEvent| {
            event.kind == kind
                && (namespace.is_empty() || event.namespace == namespace)
                && matches(&event.object, &options)
        };

        let stream = stream::unfold(
            (backlog, receiver, false),
            move |(mut backlog, mut receiver, done)| {
                let relevant = relevant.clone();
                async move {
                    if done {
                        return None;
                    }
                    while let Some(event) = backlog.pop_front() {
                        if relevant(&event) {
                            return Some((to_store_event(event), (backlog, receiver, false)));
                        }
                    }
                    loop {
                        match receiver.recv().await {
                            Ok(Signal::Event(event)) if relevant(&event) => {
                                return Some((to_store_event(event), (backlog, receiver, false)));
                            }
                            Ok(Signal::Event(_)) => continue,
                            Ok(Signal::Expire) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                return Some((Ok(StoreEvent::Expired), (backlog, receiver, true)));
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn create<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = K::kind_name();
        let namespace = scope::<K>(namespace);
        let name = meta_str(&serde_json::to_value(obj)?, "name")
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(Error::Invalid(format!("{kind} requires metadata.name")));
        }

        let mut state = self.lock();
        self.check(&mut state, Verb::Create, &kind, &namespace, &name)?;
        let key = (kind.clone(), namespace.clone(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(&kind, &namespace, &name));
        }
        if K::NAMESPACED {
            let ns_key = ("Namespace".to_string(), String::new(), namespace.clone());
            let terminating = state
                .objects
                .get(&ns_key)
                .is_some_and(|ns| meta_str(ns, "deletionTimestamp").is_some());
            if terminating {
                return Err(Error::Forbidden(format!(
                    "namespace {namespace} is being terminated"
                )));
            }
        }

        let revision = Self::next_revision(&mut state);
        let mut value = serde_json::to_value(obj)?;
        if K::NAMESPACED {
            set_meta(&mut value, "namespace", Value::String(namespace.clone()));
        }
        set_meta(&mut value, "resourceVersion", Value::String(revision.to_string()));
        set_meta(&mut value, "generation", Value::from(1));
        set_meta(&mut value, "uid", Value::String(format!("{kind}-{namespace}-{name}-{revision}").to_lowercase()));
        set_meta(&mut value, "creationTimestamp", Value::String(format_time(Utc::now())));

        state.objects.insert(key, value.clone());
        self.record(&mut state, &kind, &namespace, false, value.clone());
        decode(value)
    }

    async fn replace<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = K::kind_name();
        let namespace = scope::<K>(namespace);
        let mut value = serde_json::to_value(obj)?;
        let name = meta_str(&value, "name").unwrap_or_default().to_string();

        let mut state = self.lock();
        self.check(&mut state, Verb::Replace, &kind, &namespace, &name)?;
        let key = (kind.clone(), namespace.clone(), name.clone());
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(&kind, &namespace, &name));
        };
        check_version(&kind, &name, &value, &current)?;
        check_immutable(&kind, &name, &value, &current)?;

        // Immutable and server-owned metadata comes from the stored object
        for field in ["uid", "creationTimestamp", "deletionTimestamp", "namespace"] {
            match meta(&current).and_then(|m| m.get(field)).cloned() {
                Some(v) => set_meta(&mut value, field, v),
                None => {
                    if let Some(m) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                        m.remove(field);
                    }
                }
            }
        }
        // Status only changes through the status subresource
        if let Some(obj) = value.as_object_mut() {
            match current.get("status") {
                Some(status) => {
                    obj.insert("status".to_string(), status.clone());
                }
                None => {
                    obj.remove("status");
                }
            }
        }

        let generation = meta(&current)
            .and_then(|m| m.get("generation"))
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if current.get("spec") != value.get("spec") {
            generation + 1
        } else {
            generation
        };
        set_meta(&mut value, "generation", Value::from(generation));

        if meta_str(&current, "deletionTimestamp").is_some() && !has_finalizers(&value) {
            self.remove(&mut state, &key);
            if kind == "Namespace" {
                self.cascade(&mut state, &name);
            }
            let mut gone = value;
            set_meta(&mut gone, "resourceVersion", Value::String(state.revision.to_string()));
            return decode(gone);
        }

        let revision = Self::next_revision(&mut state);
        set_meta(&mut value, "resourceVersion", Value::String(revision.to_string()));
        state.objects.insert(key, value.clone());
        self.record(&mut state, &kind, &namespace, false, value.clone());
        decode(value)
    }

    async fn replace_status<K: StoreObject>(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = K::kind_name();
        let namespace = scope::<K>(namespace);
        let value = serde_json::to_value(obj)?;
        let name = meta_str(&value, "name").unwrap_or_default().to_string();

        let mut state = self.lock();
        self.check(&mut state, Verb::ReplaceStatus, &kind, &namespace, &name)?;
        let key = (kind.clone(), namespace.clone(), name.clone());
        let Some(mut current) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(&kind, &namespace, &name));
        };
        check_version(&kind, &name, &value, &current)?;

        if let Some(obj) = current.as_object_mut() {
            match value.get("status") {
                Some(status) if !status.is_null() => {
                    obj.insert("status".to_string(), status.clone());
                }
                _ => {
                    obj.remove("status");
                }
            }
        }
        let revision = Self::next_revision(&mut state);
        set_meta(&mut current, "resourceVersion", Value::String(revision.to_string()));
        state.objects.insert(key, current.clone());
        self.record(&mut state, &kind, &namespace, false, current.clone());
        decode(current)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let kind = K::kind_name();
        let namespace = scope::<K>(namespace);
        let mut state = self.lock();
        self.check(&mut state, Verb::Delete, &kind, &namespace, name)?;
        let key = (kind.clone(), namespace.clone(), name.to_string());
        let Some(mut current) = state.objects.get(&key).cloned() else {
            return Err(Error::not_found(&kind, &namespace, name));
        };

        if has_finalizers(&current) {
            if meta_str(&current, "deletionTimestamp").is_none() {
                let revision = Self::next_revision(&mut state);
                set_meta(&mut current, "deletionTimestamp", Value::String(format_time(Utc::now())));
                set_meta(&mut current, "resourceVersion", Value::String(revision.to_string()));
                state.objects.insert(key, current.clone());
                self.record(&mut state, &kind, &namespace, false, current);
            }
            return Ok(());
        }

        self.remove(&mut state, &key);
        if kind == "Namespace" {
            self.cascade(&mut state, name);
        }
        Ok(())
    }
}

fn check_version(kind: &str, name: &str, new: &Value, current: &Value) -> Result<()> {
    match meta_str(new, "resourceVersion") {
        Some(version) if !version.is_empty() && Some(version) != meta_str(current, "resourceVersion") => {
            Err(Error::Conflict(format!(
                "Operation cannot be fulfilled on {kind} {name:?}: the object has been modified"
            )))
        }
        _ => Ok(()),
    }
}

/// Objects marked `immutable` (Secrets, ConfigMaps) keep their payload
fn check_immutable(kind: &str, name: &str, new: &Value, current: &Value) -> Result<()> {
    if current.get("immutable").and_then(Value::as_bool) != Some(true) {
        return Ok(());
    }
    for field in ["data", "stringData", "binaryData", "type", "immutable"] {
        if new.get(field) != current.get(field) {
            return Err(Error::Invalid(format!(
                "{kind} {name:?} is invalid: {field}: field is immutable when `immutable` is set"
            )));
        }
    }
    Ok(())
}

fn to_store_event<K: StoreObject>(event: LoggedEvent) -> Result<StoreEvent<K>> {
    let obj = decode(event.object)?;
    Ok(if event.deleted {
        StoreEvent::Deleted(obj)
    } else {
        StoreEvent::Applied(obj)
    })
}

impl StoreFactory for MemoryStore {
    type Store = MemoryStore;

    fn for_identity(&self, identity: &Identity) -> Result<MemoryStore> {
        Ok(self.as_identity(identity))
    }

    fn privileged(&self) -> MemoryStore {
        Self {
            inner: self.inner.clone(),
            identity: None,
        }
    }
}
