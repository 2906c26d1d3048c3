//! Tasks: one-off commands run against an app's droplet
//!
//! A task only becomes visible once the task controller marked it
//! `Initialized`; until then `get` reports it as not found and `list` skips
//! it. Creating a task waits for that, within the request deadline.

use super::namespace_retriever::NamespaceRetriever;
use super::{created_at, for_resource, new_guid, updated_at};
use crate::awaiter::{Awaited, ConditionAwaiter};
use canopy_core::crd::{
    CanopyApp, CanopySpace, CanopyTask, CanopyTaskSpec, NamedRef, TASK_CANCELED, TASK_INITIALIZED,
};
use canopy_core::error::{Error, Result};
use canopy_core::identity::RequestContext;
use canopy_core::labels::{validate_qualified_key, APP_GUID_LABEL};
use canopy_core::retry::{retry_transient, RetryPolicy};
use canopy_core::state::task::{is_initialized, task_state, TaskState};
use canopy_core::store::{ListOptions, Store, StoreFactory};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

pub const TASK_RESOURCE: &str = "Task";
const APP_RESOURCE: &str = "App";

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub guid: String,
    pub app_guid: String,
    pub command: Vec<String>,
    pub sequence_id: i64,
    pub memory_mb: i64,
    pub disk_quota_mb: i64,
    pub droplet_guid: Option<String>,
    pub state: TaskState,
    pub failure_reason: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&CanopyTask> for TaskRecord {
    fn from(task: &CanopyTask) -> Self {
        let (state, failure_reason) = task_state(task);
        let status = task.status.clone().unwrap_or_default();
        Self {
            guid: task.name_any(),
            app_guid: task.spec.app_ref.name.clone(),
            command: task.spec.command.clone(),
            sequence_id: status.sequence_id,
            memory_mb: status.memory_mb,
            disk_quota_mb: status.disk_quota_mb,
            droplet_guid: status.droplet_ref.map(|d| d.name),
            state,
            failure_reason,
            labels: task.labels().clone(),
            annotations: task.annotations().clone(),
            created_at: created_at(task),
            updated_at: updated_at(task),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateTaskMessage {
    pub app_guid: String,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListTasksMessage {
    /// Empty matches every app
    pub app_guids: Vec<String>,
    /// Empty matches every sequence id
    pub sequence_ids: Vec<i64>,
}

/// Label and annotation changes; a `None` value removes the key
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl MetadataPatch {
    /// Reject keys that are not qualified names before anything is written
    pub fn validate(&self) -> Result<()> {
        for key in self.labels.keys() {
            validate_qualified_key(key).map_err(|e| Error::Invalid(format!("label key {e}")))?;
        }
        for key in self.annotations.keys() {
            validate_qualified_key(key).map_err(|e| Error::Invalid(format!("annotation key {e}")))?;
        }
        Ok(())
    }

    fn apply(&self, task: &mut CanopyTask) {
        apply_values(task.labels_mut(), &self.labels);
        apply_values(task.annotations_mut(), &self.annotations);
    }
}

fn apply_values(target: &mut BTreeMap<String, String>, changes: &BTreeMap<String, Option<String>>) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                target.insert(key.clone(), value.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

#[derive(Clone)]
pub struct TaskRepo<F> {
    factory: F,
    namespaces: NamespaceRetriever<F>,
    retry: RetryPolicy,
}

impl<F: StoreFactory> TaskRepo<F> {
    pub fn new(factory: F) -> Self {
        Self {
            namespaces: NamespaceRetriever::new(factory.clone()),
            factory,
            retry: RetryPolicy::default(),
        }
    }

    /// Create a task for an app and wait until it is initialized
    #[instrument(skip(self, ctx, message), fields(user = %ctx.identity, app = %message.app_guid))]
    pub async fn create(&self, ctx: &RequestContext, message: CreateTaskMessage) -> Result<TaskRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyApp>(&message.app_guid, APP_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let guid = new_guid();
        let mut task = CanopyTask::new(
            &guid,
            CanopyTaskSpec {
                command: message.command,
                app_ref: NamedRef::new(&message.app_guid),
                canceled: false,
            },
        );
        let mut labels = message.labels;
        labels.insert(APP_GUID_LABEL.to_string(), message.app_guid);
        task.metadata.labels = Some(labels);
        task.metadata.annotations = Some(message.annotations);

        let created = store.create(&namespace, &task).await?;
        info!(guid = %guid, namespace = %namespace, "Created task, waiting for initialization");

        let initialized = ConditionAwaiter::new(store)
            .await_after_write(ctx.deadline, &namespace, created, Awaited::is_true(TASK_INITIALIZED))
            .await
            .map_err(|e| for_resource(e, TASK_RESOURCE))?;
        Ok(TaskRecord::from(&initialized))
    }

    /// An initialized task; one still being set up is not found
    pub async fn get(&self, ctx: &RequestContext, guid: &str) -> Result<TaskRecord> {
        let (namespace, task) = self.fetch(ctx, guid).await?;
        if !is_initialized(&task) {
            debug!(guid = %guid, "Task not initialized yet");
            return Err(Error::not_found(TASK_RESOURCE, &namespace, guid));
        }
        Ok(TaskRecord::from(&task))
    }

    /// Initialized tasks in every space the caller can read
    pub async fn list(&self, ctx: &RequestContext, message: &ListTasksMessage) -> Result<Vec<TaskRecord>> {
        let spaces = self
            .factory
            .privileged()
            .list::<CanopySpace>("", &ListOptions::default())
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let mut records = Vec::new();
        for space in spaces.items {
            let namespace = space.name_any();
            let tasks = match store.list::<CanopyTask>(&namespace, &ListOptions::default()).await {
                Ok(list) => list.items,
                Err(Error::Forbidden(_)) => {
                    debug!(user = %ctx.identity, namespace = %namespace, "Skipping space without access");
                    continue;
                }
                Err(e) => return Err(e),
            };
            records.extend(
                tasks
                    .iter()
                    .filter(|t| is_initialized(t))
                    .map(TaskRecord::from)
                    .filter(|r| message.app_guids.is_empty() || message.app_guids.contains(&r.app_guid))
                    .filter(|r| {
                        message.sequence_ids.is_empty() || message.sequence_ids.contains(&r.sequence_id)
                    }),
            );
        }
        records.sort_by_key(|r| (r.app_guid.clone(), r.sequence_id));
        Ok(records)
    }

    /// Request cancellation and wait until the task reports it
    #[instrument(skip(self, ctx), fields(user = %ctx.identity))]
    pub async fn cancel(&self, ctx: &RequestContext, guid: &str) -> Result<TaskRecord> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyTask>(guid, TASK_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let written = retry_transient(ctx.deadline, &self.retry, "cancel task", || async {
            let mut task: CanopyTask = store.get(&namespace, guid).await?;
            if task.spec.canceled {
                return Ok(task);
            }
            task.spec.canceled = true;
            store.replace(&namespace, &task).await
        })
        .await
        .map_err(|e| for_resource(e, TASK_RESOURCE))?;
        info!(guid = %guid, "Requested task cancellation");

        let canceled = ConditionAwaiter::new(store)
            .await_after_write(ctx.deadline, &namespace, written, Awaited::is_true(TASK_CANCELED))
            .await
            .map_err(|e| for_resource(e, TASK_RESOURCE))?;
        Ok(TaskRecord::from(&canceled))
    }

    /// Add, change or remove labels and annotations
    #[instrument(skip(self, ctx, patch), fields(user = %ctx.identity))]
    pub async fn patch_metadata(
        &self,
        ctx: &RequestContext,
        guid: &str,
        patch: &MetadataPatch,
    ) -> Result<TaskRecord> {
        patch.validate()?;
        let namespace = self
            .namespaces
            .namespace_for::<CanopyTask>(guid, TASK_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;

        let patched = retry_transient(ctx.deadline, &self.retry, "patch task metadata", || async {
            let mut task: CanopyTask = store.get(&namespace, guid).await?;
            patch.apply(&mut task);
            store.replace(&namespace, &task).await
        })
        .await
        .map_err(|e| for_resource(e, TASK_RESOURCE))?;
        Ok(TaskRecord::from(&patched))
    }

    async fn fetch(&self, ctx: &RequestContext, guid: &str) -> Result<(String, CanopyTask)> {
        let namespace = self
            .namespaces
            .namespace_for::<CanopyTask>(guid, TASK_RESOURCE)
            .await?;
        let store = self.factory.for_identity(&ctx.identity)?;
        let task = store
            .get(&namespace, guid)
            .await
            .map_err(|e| for_resource(e, TASK_RESOURCE))?;
        Ok((namespace, task))
    }
}
