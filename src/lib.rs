//! Durable workflow orchestration core.
//!
//! Orchestrations are ordinary `async` functions written against an
//! [`OrchestrationContext`]. Every awaitable call on the context is recorded in
//! an append-only history of [`Event`]s; after a crash or restart the runtime
//! replays that history through the same code and the orchestration resumes
//! exactly where it left off.
//!
//! - Data model: [`Event`], [`EventKind`], [`Command`], [`ErrorDetails`], [`RetryPolicy`]
//! - Orchestration API: [`OrchestrationContext`], [`DurableFuture`], `when_all` / `when_any`
//! - Replay driver: [`run_turn`]
//! - Runtime: [`runtime::Runtime`] with activity and orchestration registries
//! - Control plane: [`Client`]
//! - Saga helper: [`saga::Compensations`]
//!
//! ```rust,no_run
//! use duroflow::providers::in_memory::InMemoryProvider;
//! use duroflow::runtime::{Runtime, registry::ActivityRegistry};
//! use duroflow::{ActivityContext, Client, OrchestrationContext, OrchestrationRegistry};
//!
//! # async fn demo() {
//! let provider = InMemoryProvider::new();
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloWorld", |ctx: OrchestrationContext, name: String| async move {
//!         ctx.call_activity("Greet", name).into_activity().await
//!     })
//!     .build();
//! let rt = Runtime::start(provider.clone(), provider.clone(), activities, orchestrations).await;
//! let client = Client::new(provider.clone(), provider);
//! let id = client.start_workflow("HelloWorld", None, "Rust").await.unwrap();
//! let _ = client.wait_for_completion(&id, std::time::Duration::from_secs(5)).await;
//! rt.shutdown().await;
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod client;
pub mod context;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod saga;

pub use client::{Client, ClientError, InstanceInfo, StartOptions};
pub use crate::context::{OrchestrationContext, TurnMeta, TurnOutput, run_turn};
pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry, VersionPolicy};
pub use runtime::status::InstanceStatus;

/// First sequence number of every generation's history.
pub const INITIAL_EVENT_ID: u64 = 1;
/// Generation assigned to a freshly started instance.
pub const INITIAL_GENERATION: u64 = 1;

pub(crate) const SYSCALL_OP_GUID: &str = "guid";
pub(crate) const SYSCALL_OP_UTCNOW_MS: &str = "utcnow_ms";

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so string-typed handlers interoperate
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
            }
        }
    }
}

/// Milliseconds since the unix epoch, used to stamp runtime-created events.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Retry policy applied by the activity executor before a failure is
/// reported to the orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Whether another attempt may run after `attempt` (1-based) failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let coefficient = if self.backoff_coefficient.is_finite() && self.backoff_coefficient >= 1.0 {
            self.backoff_coefficient
        } else {
            1.0
        };
        let millis = self.initial_interval.as_millis() as f64 * coefficient.powi(exponent);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Error categories that can reach history. Only `Configuration::Nondeterminism`
/// is fatal to an instance by itself; everything else is delivered to
/// orchestration code or retried by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetails {
    /// Failure raised by user code (activity, orchestration, child).
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    /// Deployment or code-shape problem detected by the runtime.
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    /// Store or queue failure.
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    RetryExhausted,
    OrchestrationFailed,
    ChildFailed,
    Panicked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    Nondeterminism,
    UnregisteredOrchestration,
    UnregisteredActivity,
}

impl ErrorDetails {
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Application { retryable, .. } => *retryable,
            ErrorDetails::Configuration { .. } => false,
            ErrorDetails::Infrastructure { retryable, .. } => *retryable,
        }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            }
        )
    }

    /// The opaque payload exposed as instance output on failure. Application
    /// errors surface their message verbatim.
    pub fn payload(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } => message.clone(),
            other => other.display_message(),
        }
    }

    /// Human-readable message shown to orchestration code and operators.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::ActivityFailed | AppErrorKind::OrchestrationFailed => message.clone(),
                AppErrorKind::RetryExhausted => format!("retries exhausted: {message}"),
                AppErrorKind::ChildFailed => format!("child failed: {message}"),
                AppErrorKind::Panicked => format!("panicked: {message}"),
                AppErrorKind::Terminated => format!("terminated: {message}"),
            },
            ErrorDetails::Configuration { kind, resource, message } => {
                let head = match kind {
                    ConfigErrorKind::Nondeterminism => "nondeterministic".to_string(),
                    ConfigErrorKind::UnregisteredOrchestration => format!("unregistered orchestration: {resource}"),
                    ConfigErrorKind::UnregisteredActivity => format!("unregistered activity: {resource}"),
                };
                match message {
                    Some(m) => format!("{head}: {m}"),
                    None => head,
                }
            }
            ErrorDetails::Infrastructure { operation, message, .. } => {
                format!("infrastructure error in {operation}: {message}")
            }
        }
    }

    pub(crate) fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: String::new(),
            message: Some(message.into()),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.category(), self.display_message())
    }
}

/// Terminal outcome recorded by `ExecutionCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionResult {
    Completed { output: String },
    Failed { details: ErrorDetails },
    Terminated { reason: String },
}

/// One immutable history record. `event_id` is the per-generation sequence
/// number; completions carry the `event_id` of the scheduling event they
/// resolve in `source_event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub source_event_id: Option<u64>,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// First event of every generation.
    OrchestratorStarted {
        workflow_type: String,
        version: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    TaskScheduled {
        name: String,
        input: String,
        retry_policy: Option<RetryPolicy>,
    },
    TaskCompleted {
        result: String,
    },
    TaskFailed {
        details: ErrorDetails,
        attempts: u32,
    },
    TimerCreated {
        fire_at_ms: u64,
    },
    TimerFired {
        fire_at_ms: u64,
    },
    /// The orchestration started waiting for an external event by name.
    EventSubscribed {
        name: String,
    },
    EventRaised {
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        workflow_type: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        result: String,
    },
    SubOrchestrationFailed {
        details: ErrorDetails,
    },
    /// Recorded non-deterministic value (GUID, wall clock).
    SystemCall {
        op: String,
        value: String,
    },
    /// Terminal for the current generation; the next one starts with `input`.
    ContinueAsNew {
        input: String,
    },
    ExecutionCompleted {
        result: ExecutionResult,
    },
}

impl Event {
    pub fn new(event_id: u64, source_event_id: Option<u64>, timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            source_event_id,
            timestamp_ms,
            kind,
        }
    }

    /// Events produced by an awaitable context call, claimed in order on replay.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskScheduled { .. }
                | EventKind::TimerCreated { .. }
                | EventKind::EventSubscribed { .. }
                | EventKind::SubOrchestrationScheduled { .. }
                | EventKind::SystemCall { .. }
        )
    }

    pub fn is_completion(&self) -> bool {
        matches!(
            self.kind,
            EventKind::TaskCompleted { .. }
                | EventKind::TaskFailed { .. }
                | EventKind::TimerFired { .. }
                | EventKind::EventRaised { .. }
                | EventKind::SubOrchestrationCompleted { .. }
                | EventKind::SubOrchestrationFailed { .. }
        )
    }

    /// Whether this event ends its generation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ContinueAsNew { .. } | EventKind::ExecutionCompleted { .. }
        )
    }
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::OrchestratorStarted { .. } => "OrchestratorStarted",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::EventSubscribed { .. } => "EventSubscribed",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            EventKind::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            EventKind::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            EventKind::SystemCall { .. } => "SystemCall",
            EventKind::ContinueAsNew { .. } => "ContinueAsNew",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
        }
    }
}

/// Pending intention emitted by one replay pass. The runtime materializes
/// commands into outbound work after their scheduling events are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ScheduleActivity {
        task_id: u64,
        name: String,
        input: String,
        retry_policy: Option<RetryPolicy>,
    },
    ScheduleTimer {
        timer_id: u64,
        fire_at_ms: u64,
    },
    ScheduleSubOrchestration {
        id: u64,
        workflow_type: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    WaitForExternalEvent {
        id: u64,
        name: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

/// Context handed to activity functions.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    generation: u64,
    task_id: u64,
    activity_name: String,
    attempt: u32,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: String,
        generation: u64,
        task_id: u64,
        activity_name: String,
        attempt: u32,
    ) -> Self {
        Self {
            instance_id,
            generation,
            task_id,
            activity_name,
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Correlation key of this task within its orchestration generation.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1-based attempt number; greater than one on retries.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Stable key for de-duplicating side effects across redeliveries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.instance_id, self.generation, self.task_id)
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "duroflow::activity",
            instance_id = %self.instance_id,
            generation = self.generation,
            task_id = self.task_id,
            activity_name = %self.activity_name,
            attempt = self.attempt,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "duroflow::activity",
            instance_id = %self.instance_id,
            generation = self.generation,
            task_id = self.task_id,
            activity_name = %self.activity_name,
            attempt = self.attempt,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "duroflow::activity",
            instance_id = %self.instance_id,
            generation = self.generation,
            task_id = self.task_id,
            activity_name = %self.activity_name,
            attempt = self.attempt,
            "{}",
            message.into()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::_typed_codec::{Codec, Json};

    #[test]
    fn retry_policy_backoff_is_capped() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(Duration::from_millis(100))
            .with_backoff_coefficient(2.0)
            .with_max_interval(Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert!(policy.allows_retry_after(4));
        assert!(!policy.allows_retry_after(5));
    }

    #[test]
    fn retry_policy_never_allows_zero_attempts() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.allows_retry_after(1));
    }

    #[test]
    fn error_details_messages_by_category() {
        let app = ErrorDetails::Application {
            kind: AppErrorKind::ActivityFailed,
            message: "boom".into(),
            retryable: false,
        };
        assert_eq!(app.display_message(), "boom");
        assert_eq!(app.payload(), "boom");
        assert_eq!(app.category(), "application");

        let nd = ErrorDetails::nondeterminism("schedule mismatch");
        assert!(nd.is_nondeterminism());
        assert!(!nd.is_retryable());
        assert_eq!(nd.display_message(), "nondeterministic: schedule mismatch");

        let unreg = ErrorDetails::Configuration {
            kind: ConfigErrorKind::UnregisteredActivity,
            resource: "Missing".into(),
            message: None,
        };
        assert_eq!(unreg.display_message(), "unregistered activity: Missing");
    }

    #[test]
    fn json_codec_passes_plain_strings_through() {
        assert_eq!(Json::encode(&"hello").unwrap(), "hello");
        assert_eq!(Json::encode(&42u32).unwrap(), "42");
        let s: String = Json::decode("hello").unwrap();
        assert_eq!(s, "hello");
        let n: u32 = Json::decode("42").unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn event_classification() {
        let scheduled = Event::new(
            2,
            None,
            0,
            EventKind::TaskScheduled {
                name: "A".into(),
                input: "x".into(),
                retry_policy: None,
            },
        );
        assert!(scheduled.is_scheduling());
        assert!(!scheduled.is_completion());

        let done = Event::new(3, Some(2), 0, EventKind::TaskCompleted { result: "y".into() });
        assert!(done.is_completion());
        assert!(!done.is_terminal());

        let can = Event::new(4, None, 0, EventKind::ContinueAsNew { input: "1".into() });
        assert!(can.is_terminal());
    }
}
