//! Subscriber setup and replay-safe logging macros.
//!
//! Orchestration code runs again on every replay, so plain `tracing` calls in
//! an orchestrator would repeat. The `durable_*` macros (and
//! `OrchestrationContext::trace_*`) only emit when the context is executing
//! new code.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

/// Subscriber the runtime installs at startup when
/// [`RuntimeOptions::logging`](crate::runtime::RuntimeOptions::logging) is set.
/// `RUST_LOG` overrides `level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Install a subscriber with an explicit default level and format. Fails if
/// a global subscriber is already set.
pub fn init_logging(default_level: &str, format: LogFormat) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    }
    .map_err(|e| format!("failed to initialize logging: {e}"))
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(target: "duroflow::orchestration", instance_id = %$ctx.instance_id(), generation = $ctx.generation(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(target: "duroflow::orchestration", instance_id = %$ctx.instance_id(), generation = $ctx.generation(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(target: "duroflow::orchestration", instance_id = %$ctx.instance_id(), generation = $ctx.generation(), $($arg)+);
        }
    }};
}
