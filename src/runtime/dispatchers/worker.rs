//! Worker (activity) dispatcher implementation for Runtime
//!
//! Spawns concurrent activity workers that lease `ActivityExecute` items,
//! run the registered handler under a renewing lease, apply the retry
//! policy and report the outcome to the orchestrator queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ::futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::Runtime;
use super::spawn_lease_renewal_task;
use crate::providers::{Lease, QueueKind, WorkItem};
use crate::{ActivityContext, AppErrorKind, ConfigErrorKind, ErrorDetails, RetryPolicy};

/// Redelivery delay when reporting an activity result fails.
const REPORT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What happens after a failed attempt.
#[derive(Debug, PartialEq)]
enum FailureStep {
    Retry(Duration),
    Report(ErrorDetails),
}

fn next_step_after_failure(
    retry_policy: Option<&RetryPolicy>,
    attempt: u32,
    kind: AppErrorKind,
    message: String,
) -> FailureStep {
    match retry_policy {
        Some(policy) if policy.allows_retry_after(attempt) => FailureStep::Retry(policy.delay_for_attempt(attempt)),
        Some(policy) if policy.max_attempts > 1 => FailureStep::Report(ErrorDetails::Application {
            kind: AppErrorKind::RetryExhausted,
            message,
            retryable: false,
        }),
        _ => FailureStep::Report(ErrorDetails::Application {
            kind,
            message,
            retryable: false,
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "activity panicked".to_string())
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt
                            .queue
                            .dequeue_with_lease(QueueKind::Worker, rt.options.worker_lock_timeout)
                            .await
                        {
                            Ok(Some(lease)) => rt.execute_activity(&worker_id, lease).await,
                            Ok(None) => tokio::time::sleep(rt.options.dispatcher_idle_sleep).await,
                            Err(e) => {
                                warn!(target: "duroflow::runtime", worker_id = %worker_id, error = %e, "worker dequeue failed");
                                tokio::time::sleep(rt.options.dispatcher_idle_sleep).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }

            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    async fn execute_activity(&self, worker_id: &str, lease: Lease) {
        let WorkItem::ActivityExecute {
            instance,
            generation,
            task_id,
            name,
            input,
            attempt,
            retry_policy,
        } = lease.item.clone()
        else {
            error!(target: "duroflow::runtime", worker_id = %worker_id, kind = lease.item.kind_name(), "unexpected item on worker queue; dropping");
            let _ = self.queue.ack(QueueKind::Worker, &lease.token).await;
            return;
        };

        let renewal = spawn_lease_renewal_task(
            self.queue.clone(),
            QueueKind::Worker,
            lease.token.clone(),
            self.options.worker_lock_timeout,
            self.options.worker_lock_renewal_buffer,
            self.shutdown_flag.clone(),
        );

        debug!(
            target: "duroflow::runtime",
            instance_id = %instance,
            generation,
            activity_name = %name,
            task_id,
            attempt,
            worker_id = %worker_id,
            "activity started"
        );
        let start_time = std::time::Instant::now();

        // None: no handler registered under this name
        let outcome = match self.activities.get(&name) {
            Some(handler) => {
                let ctx = ActivityContext::new(instance.clone(), generation, task_id, name.clone(), attempt);
                match AssertUnwindSafe(handler.invoke(ctx, input.clone())).catch_unwind().await {
                    Ok(Ok(result)) => {
                        debug!(
                            target: "duroflow::runtime",
                            instance_id = %instance,
                            activity_name = %name,
                            task_id,
                            attempt,
                            outcome = "success",
                            duration_ms = start_time.elapsed().as_millis() as u64,
                            result_size = result.len(),
                            "activity completed"
                        );
                        Some(Ok(result))
                    }
                    Ok(Err(message)) => Some(Err((AppErrorKind::ActivityFailed, message))),
                    Err(payload) => Some(Err((AppErrorKind::Panicked, panic_message(payload.as_ref())))),
                }
            }
            None => None,
        };
        renewal.abort();

        let (queue_kind, item, delay) = match outcome {
            Some(Ok(result)) => (
                QueueKind::Orchestrator,
                WorkItem::ActivityCompleted {
                    instance: instance.clone(),
                    generation,
                    task_id,
                    result,
                },
                Duration::ZERO,
            ),
            Some(Err((kind, message))) => {
                warn!(
                    target: "duroflow::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    task_id,
                    attempt,
                    outcome = if kind == AppErrorKind::Panicked { "panicked" } else { "app_error" },
                    duration_ms = start_time.elapsed().as_millis() as u64,
                    error = %message,
                    "activity failed"
                );
                match next_step_after_failure(retry_policy.as_ref(), attempt, kind, message) {
                    FailureStep::Retry(delay) => (
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.clone(),
                            generation,
                            task_id,
                            name: name.clone(),
                            input,
                            attempt: attempt + 1,
                            retry_policy,
                        },
                        delay,
                    ),
                    FailureStep::Report(details) => (
                        QueueKind::Orchestrator,
                        WorkItem::ActivityFailed {
                            instance: instance.clone(),
                            generation,
                            task_id,
                            details,
                            attempts: attempt,
                        },
                        Duration::ZERO,
                    ),
                }
            }
            None => {
                error!(
                    target: "duroflow::runtime",
                    instance_id = %instance,
                    activity_name = %name,
                    task_id,
                    outcome = "config_error",
                    "activity not registered"
                );
                (
                    QueueKind::Orchestrator,
                    WorkItem::ActivityFailed {
                        instance: instance.clone(),
                        generation,
                        task_id,
                        details: ErrorDetails::Configuration {
                            kind: ConfigErrorKind::UnregisteredActivity,
                            resource: name.clone(),
                            message: None,
                        },
                        attempts: attempt,
                    },
                    Duration::ZERO,
                )
            }
        };

        // report first, then release; a crash in between re-runs the attempt
        let settled = match self.queue.enqueue(queue_kind, item, delay).await {
            Ok(()) => self.queue.ack(QueueKind::Worker, &lease.token).await,
            Err(e) => {
                warn!(
                    target: "duroflow::runtime",
                    instance_id = %instance,
                    task_id,
                    worker_id = %worker_id,
                    error = %e,
                    "failed to report activity result; will rerun"
                );
                self.queue.nack(QueueKind::Worker, &lease.token, REPORT_RETRY_DELAY).await
            }
        };
        if let Err(e) = settled {
            warn!(
                target: "duroflow::runtime",
                instance_id = %instance,
                task_id,
                worker_id = %worker_id,
                error = %e,
                "failed to settle worker lease"
            );
        }
    }
}
