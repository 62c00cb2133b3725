//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: pulls orchestrator-queue items and hands them to the instance manager
//! - `worker`: executes activities and reports results back

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::providers::{QueueKind, TaskQueue};

mod orchestration;
mod worker;

/// Renewal interval for a lease of `lock_timeout`.
///
/// - timeout >= 15s: renew at (timeout - buffer)
/// - timeout < 15s: renew at half the timeout, buffer ignored
fn calculate_renewal_interval(lock_timeout: Duration, buffer: Duration) -> Duration {
    if lock_timeout >= Duration::from_secs(15) {
        let buffer = buffer.min(lock_timeout);
        lock_timeout
            .checked_sub(buffer)
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1))
    } else {
        (lock_timeout / 2).max(Duration::from_millis(10))
    }
}

/// Keep a lease alive until the returned handle is aborted, the renewal
/// fails, or the runtime shuts down.
fn spawn_lease_renewal_task(
    queue: Arc<dyn TaskQueue>,
    kind: QueueKind,
    token: String,
    lock_timeout: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer);

    tracing::debug!(
        target: "duroflow::runtime::dispatchers",
        lock_token = %token,
        queue = ?kind,
        lock_timeout_ms = lock_timeout.as_millis() as u64,
        renewal_interval_ms = renewal_interval.as_millis() as u64,
        "spawning lease renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // first tick is immediate

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match queue.renew_lease(kind, &token, lock_timeout).await {
                Ok(()) => {
                    tracing::trace!(target: "duroflow::runtime::dispatchers", lock_token = %token, "lease renewed");
                }
                Err(e) => {
                    tracing::debug!(
                        target: "duroflow::runtime::dispatchers",
                        lock_token = %token,
                        error = %e,
                        "failed to renew lease (may have been acked)"
                    );
                    break;
                }
            }
        }
    })
}
