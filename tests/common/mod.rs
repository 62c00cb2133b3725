#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use duroflow::logging::{LogFormat, LoggingOptions};
use duroflow::providers::in_memory::InMemoryProvider;
use duroflow::runtime::{Runtime, RuntimeOptions};
use duroflow::{ActivityRegistry, Client, Event, EventKind, InstanceInfo, OrchestrationRegistry};

/// Runtime options tuned for tests: short polls and leases.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        orchestration_concurrency: 2,
        worker_concurrency: 4,
        orchestrator_lock_timeout: Duration::from_secs(5),
        worker_lock_timeout: Duration::from_secs(5),
        busy_instance_retry_delay: Duration::from_millis(5),
        suspended_redelivery_delay: Duration::from_millis(20),
        logging: Some(LoggingOptions {
            level: "warn".into(),
            format: LogFormat::Compact,
        }),
        ..Default::default()
    }
}

pub struct Harness {
    pub provider: Arc<InMemoryProvider>,
    pub runtime: Arc<Runtime>,
    pub client: Client,
}

impl Harness {
    pub async fn start(activities: ActivityRegistry, orchestrations: OrchestrationRegistry) -> Self {
        Self::start_with_options(activities, orchestrations, fast_options()).await
    }

    pub async fn start_with_options(
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Self {
        let provider = InMemoryProvider::new();
        let runtime = Runtime::start_with_options(provider.clone(), provider.clone(), activities, orchestrations, options).await;
        let client = Client::new(provider.clone(), provider.clone());
        Self {
            provider,
            runtime,
            client,
        }
    }

    /// Replace the runtime with one running different registrations over the
    /// same store, as a redeploy would.
    pub async fn restart(self, activities: ActivityRegistry, orchestrations: OrchestrationRegistry) -> Self {
        self.runtime.shutdown().await;
        let runtime = Runtime::start_with_options(
            self.provider.clone(),
            self.provider.clone(),
            activities,
            orchestrations,
            fast_options(),
        )
        .await;
        Self { runtime, ..self }
    }

    pub async fn run(&self, workflow_type: &str, id: &str, input: &str) -> InstanceInfo {
        self.client
            .start_workflow(workflow_type, Some(id), input)
            .await
            .unwrap();
        self.client
            .wait_for_completion(id, Duration::from_secs(10))
            .await
            .unwrap()
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}

/// Poll generation `generation` of `instance` until `predicate` holds.
pub async fn wait_for_history<F>(client: &Client, instance: &str, generation: u64, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = client.read_history(instance, generation).await
            && predicate(&hist)
        {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_subscription(client: &Client, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        client,
        instance,
        1,
        |hist| {
            hist.iter()
                .any(|e| matches!(&e.kind, EventKind::EventSubscribed { name: n } if n == name))
        },
        timeout_ms,
    )
    .await
}

/// Kind names of a history, for compact assertions.
pub fn kinds(history: &[Event]) -> Vec<&'static str> {
    history.iter().map(|e| e.kind.name()).collect()
}
