use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{HistoryStore, InstanceRecord, ProviderError, QueueKind, TaskQueue, WorkItem};
use crate::runtime::status::InstanceStatus;
use crate::{ErrorDetails, Event, now_ms};

/// Poll interval of [`Client::wait_for_completion`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),
    #[error("timed out after {waited:?} waiting for {instance}")]
    Timeout { instance: String, waited: Duration },
    #[error("failed to encode input: {0}")]
    Serialization(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Options for [`Client::start_workflow_with`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Caller-chosen id; a UUID is generated when absent.
    pub instance_id: Option<String>,
    /// Pin a registered version instead of the registry's policy.
    pub version: Option<String>,
    /// Return the existing id instead of `InstanceAlreadyExists`.
    pub idempotent: bool,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// Snapshot of an instance as seen by the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub workflow_type: String,
    /// Empty until the first generation starts.
    pub version: String,
    pub status: InstanceStatus,
    pub generation: u64,
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
    /// Result on completion, error payload on failure, reason on termination.
    pub output: Option<String>,
    pub failure: Option<ErrorDetails>,
    pub parent_instance_id: Option<String>,
}

impl From<InstanceRecord> for InstanceInfo {
    fn from(r: InstanceRecord) -> Self {
        Self {
            instance_id: r.instance_id,
            workflow_type: r.workflow_type,
            version: r.version,
            status: r.status,
            generation: r.generation,
            created_at_ms: r.created_at_ms,
            last_updated_at_ms: r.last_updated_at_ms,
            output: r.output,
            failure: r.failure,
            parent_instance_id: r.parent_instance_id,
        }
    }
}

/// Control-plane client.
///
/// Talks to the runtime only through the shared store and queues, so it can
/// live in a different process than the dispatchers.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
    queue: Arc<dyn TaskQueue>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Create an instance and enqueue its start. Returns the instance id.
    pub async fn start_workflow(
        &self,
        workflow_type: impl Into<String>,
        instance_id: Option<&str>,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let options = StartOptions {
            instance_id: instance_id.map(str::to_string),
            ..Default::default()
        };
        self.start_workflow_with(workflow_type, input, options).await
    }

    pub async fn start_workflow_with(
        &self,
        workflow_type: impl Into<String>,
        input: impl Into<String>,
        options: StartOptions,
    ) -> Result<String, ClientError> {
        let id = options
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut record = InstanceRecord::new(id.clone(), workflow_type, input);
        record.version = options.version.unwrap_or_default();
        let workflow_type = record.workflow_type.clone();

        match self.store.create_instance(record).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                if options.idempotent {
                    debug!(target: "duroflow::client", instance_id = %id, "instance exists; idempotent start");
                    return Ok(id);
                }
                return Err(ClientError::InstanceAlreadyExists(id));
            }
            Err(e) => return Err(e.into()),
        }

        self.queue
            .enqueue(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration { instance: id.clone() },
                Duration::ZERO,
            )
            .await?;
        debug!(target: "duroflow::client", instance_id = %id, workflow_type = %workflow_type, "workflow start enqueued");
        Ok(id)
    }

    /// Start with typed input serialized as JSON.
    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        workflow_type: impl Into<String>,
        instance_id: Option<&str>,
        input: &In,
    ) -> Result<String, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Serialization)?;
        self.start_workflow(workflow_type, instance_id, payload).await
    }

    pub async fn get_status(&self, instance_id: &str) -> Result<InstanceInfo, ClientError> {
        Ok(self.record(instance_id).await?.into())
    }

    /// Deliver a named event. Events raised before the orchestration
    /// subscribes are buffered in history.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.record(instance_id).await?;
        self.enqueue_control(WorkItem::ExternalRaised {
            instance: instance_id.to_string(),
            name: event_name.into(),
            data: data.into(),
        })
        .await
    }

    /// Stop the instance (and its running children) without running any
    /// more orchestration code. No-op on finished instances.
    pub async fn terminate(&self, instance_id: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.record(instance_id).await?;
        self.enqueue_control(WorkItem::Terminate {
            instance: instance_id.to_string(),
            reason: reason.into(),
        })
        .await
    }

    pub async fn suspend(&self, instance_id: &str) -> Result<(), ClientError> {
        self.record(instance_id).await?;
        self.enqueue_control(WorkItem::Suspend {
            instance: instance_id.to_string(),
        })
        .await
    }

    pub async fn resume(&self, instance_id: &str) -> Result<(), ClientError> {
        self.record(instance_id).await?;
        self.enqueue_control(WorkItem::Resume {
            instance: instance_id.to_string(),
        })
        .await
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_completion(&self, instance_id: &str, timeout: Duration) -> Result<InstanceInfo, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let info = self.get_status(instance_id).await?;
            if info.status.is_terminal() {
                return Ok(info);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    instance: instance_id.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// History of one generation.
    pub async fn read_history(&self, instance_id: &str, generation: u64) -> Result<Vec<Event>, ClientError> {
        self.record(instance_id).await?;
        Ok(self.store.read(instance_id, generation).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    async fn record(&self, instance_id: &str) -> Result<InstanceRecord, ClientError> {
        self.store
            .read_instance(instance_id)
            .await?
            .ok_or_else(|| ClientError::InstanceNotFound(instance_id.to_string()))
    }

    async fn enqueue_control(&self, item: WorkItem) -> Result<(), ClientError> {
        debug!(
            target: "duroflow::client",
            instance_id = %item.instance(),
            kind = item.kind_name(),
            at_ms = now_ms(),
            "control item enqueued"
        );
        Ok(self.queue.enqueue(QueueKind::Orchestrator, item, Duration::ZERO).await?)
    }
}
