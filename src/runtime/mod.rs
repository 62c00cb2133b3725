//! Runtime: dispatcher loops that drive orchestrations and activities off the
//! task queues.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::logging::LoggingOptions;
use crate::providers::{HistoryStore, TaskQueue};
use crate::{ActivityContext, OrchestrationContext};

pub mod dispatchers;
pub mod instance_manager;
pub mod registry;
pub mod replay_engine;
pub mod status;

use instance_manager::InstanceManager;
pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy};

/// Tuning knobs for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a queue is empty.
    pub dispatcher_idle_sleep: Duration,
    /// Concurrent orchestration dispatchers.
    pub orchestration_concurrency: usize,
    /// Concurrent activity workers.
    pub worker_concurrency: usize,
    /// Lease length for orchestrator queue items.
    pub orchestrator_lock_timeout: Duration,
    /// Lease length for activity items; renewed while the activity runs.
    pub worker_lock_timeout: Duration,
    /// How long before expiry an activity lease is renewed. Only applies
    /// to leases of 15s or more; shorter leases renew at half their length.
    pub worker_lock_renewal_buffer: Duration,
    /// Redelivery delay for an item whose instance is being processed.
    pub busy_instance_retry_delay: Duration,
    /// Redelivery delay for items parked on a suspended instance.
    pub suspended_redelivery_delay: Duration,
    /// Replay attempts per work item when appends hit version conflicts.
    pub max_append_attempts: u32,
    /// Global tracing subscriber to install at startup. `None` leaves
    /// subscriber setup to the embedding application.
    pub logging: Option<LoggingOptions>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            orchestrator_lock_timeout: Duration::from_secs(30),
            worker_lock_timeout: Duration::from_secs(30),
            worker_lock_renewal_buffer: Duration::from_secs(5),
            busy_instance_retry_delay: Duration::from_millis(20),
            suspended_redelivery_delay: Duration::from_millis(100),
            max_append_attempts: 5,
            logging: None,
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime: orchestration dispatchers feed the instance manager,
/// worker dispatchers execute activities.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    queue: Arc<dyn TaskQueue>,
    manager: Arc<InstanceManager>,
    activities: ActivityRegistry,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    runtime_id: String,
}

impl Runtime {
    pub async fn start(
        store: Arc<dyn HistoryStore>,
        queue: Arc<dyn TaskQueue>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, queue, activities, orchestrations, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        queue: Arc<dyn TaskQueue>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if let Some(logging) = &options.logging
            && let Err(e) = crate::logging::init_logging(&logging.level, logging.format)
        {
            tracing::debug!(target: "duroflow::runtime", error = %e, "keeping existing tracing subscriber");
        }

        let manager = Arc::new(InstanceManager::new(
            store,
            queue.clone(),
            orchestrations,
            options.clone(),
        ));
        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            queue,
            manager,
            activities,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let orch = runtime.clone().start_orchestration_dispatcher();
        let work = runtime.clone().start_work_dispatcher();
        runtime.joins.lock().await.extend([orch, work]);

        tracing::debug!(
            target: "duroflow::runtime",
            runtime_id = %runtime.runtime_id,
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            worker_concurrency = runtime.options.worker_concurrency,
            "runtime started"
        );
        runtime
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Stop all dispatchers. In-flight leases expire and are redelivered to
    /// whichever runtime polls the queues next.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, std::sync::atomic::Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        tracing::debug!(target: "duroflow::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }
}
