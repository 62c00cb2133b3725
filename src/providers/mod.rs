use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::status::InstanceStatus;
use crate::{ErrorDetails, Event, RetryPolicy};

mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// In-memory provider implementing both interfaces, for tests and embedding.
pub mod in_memory;

/// Control-plane view of one workflow instance. Mutated only by the instance
/// manager while it holds the instance lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub workflow_type: String,
    /// Pinned orchestration version. Empty until the first generation starts.
    pub version: String,
    pub status: InstanceStatus,
    pub input: String,
    pub output: Option<String>,
    pub failure: Option<ErrorDetails>,
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
    pub generation: u64,
    pub parent_instance_id: Option<String>,
    pub parent_generation: Option<u64>,
    /// `event_id` of the parent's `SubOrchestrationScheduled`.
    pub parent_event_id: Option<u64>,
}

impl InstanceRecord {
    pub fn new(instance_id: impl Into<String>, workflow_type: impl Into<String>, input: impl Into<String>) -> Self {
        let now = crate::now_ms();
        Self {
            instance_id: instance_id.into(),
            workflow_type: workflow_type.into(),
            version: String::new(),
            status: InstanceStatus::Pending,
            input: input.into(),
            output: None,
            failure: None,
            created_at_ms: now,
            last_updated_at_ms: now,
            generation: crate::INITIAL_GENERATION,
            parent_instance_id: None,
            parent_generation: None,
            parent_event_id: None,
        }
    }
}

/// Messages exchanged through the task queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
    },
    ActivityExecute {
        instance: String,
        generation: u64,
        task_id: u64,
        name: String,
        input: String,
        attempt: u32,
        retry_policy: Option<RetryPolicy>,
    },
    ActivityCompleted {
        instance: String,
        generation: u64,
        task_id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        generation: u64,
        task_id: u64,
        details: ErrorDetails,
        attempts: u32,
    },
    TimerFired {
        instance: String,
        generation: u64,
        timer_id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_generation: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_generation: u64,
        parent_id: u64,
        details: ErrorDetails,
    },
    /// Start generation `generation` of an instance that continued as new.
    ContinueAsNew {
        instance: String,
        generation: u64,
        input: String,
        version: Option<String>,
    },
    Terminate {
        instance: String,
        reason: String,
    },
    Suspend {
        instance: String,
    },
    Resume {
        instance: String,
    },
}

impl WorkItem {
    /// Instance this item is routed to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::Terminate { instance, .. }
            | WorkItem::Suspend { instance }
            | WorkItem::Resume { instance } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }

    /// Control items are processed even while an instance is suspended.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            WorkItem::Terminate { .. } | WorkItem::Suspend { .. } | WorkItem::Resume { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
            WorkItem::Terminate { .. } => "Terminate",
            WorkItem::Suspend { .. } => "Suspend",
            WorkItem::Resume { .. } => "Resume",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Orchestrator,
    Worker,
}

/// A work item leased from a queue. Invisible to other consumers until the
/// lease expires, is acked, or is nacked.
#[derive(Debug, Clone)]
pub struct Lease {
    pub item: WorkItem,
    pub token: String,
    /// 1 on first delivery. Counts nacked deliveries too.
    pub delivery_count: u32,
    /// An earlier lease on this item expired without ack or nack, so its
    /// consumer may have died part way through.
    pub redelivered: bool,
}

/// Durable store for instance records and per-generation, append-only history.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fails with `AlreadyExists` if the id is taken.
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError>;

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    async fn update_instance(&self, record: InstanceRecord) -> Result<(), ProviderError>;

    /// History of one generation; empty if it has not started.
    async fn read(&self, instance: &str, generation: u64) -> Result<Vec<Event>, ProviderError>;

    /// Append atomically if the generation currently holds exactly
    /// `expected_version` events, else fail with `VersionConflict`.
    async fn append(
        &self,
        instance: &str,
        generation: u64,
        expected_version: usize,
        events: Vec<Event>,
    ) -> Result<(), ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Remove an instance and all of its history.
    async fn purge(&self, instance: &str) -> Result<(), ProviderError>;
}

/// At-least-once queues with lease (peek-lock) semantics and delayed
/// visibility.
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, kind: QueueKind, item: WorkItem, delay: Duration) -> Result<(), ProviderError>;

    async fn dequeue_with_lease(
        &self,
        kind: QueueKind,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, ProviderError>;

    async fn renew_lease(&self, kind: QueueKind, token: &str, extend_by: Duration) -> Result<(), ProviderError>;

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Release the lease; the item becomes visible again after `delay`.
    async fn nack(&self, kind: QueueKind, token: &str, delay: Duration) -> Result<(), ProviderError>;
}
