//! Orchestration dispatcher implementation for Runtime
//!
//! Spawns `orchestration_concurrency` loops that lease orchestrator-queue
//! items and hand them to the instance manager. The manager serializes work
//! per instance; the dispatcher only translates its disposition into
//! ack/nack and backs off on provider errors.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::Runtime;
use super::super::instance_manager::Disposition;
use crate::providers::{Lease, QueueKind};

/// Backoff for an item whose processing hit a transient provider error.
fn retry_backoff(delivery_count: u32) -> Duration {
    let exp = delivery_count.saturating_sub(1).min(6);
    Duration::from_millis(50u64 << exp)
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt
                            .queue
                            .dequeue_with_lease(QueueKind::Orchestrator, rt.options.orchestrator_lock_timeout)
                            .await
                        {
                            Ok(Some(lease)) => rt.process_orchestrator_item(&worker_id, lease).await,
                            Ok(None) => tokio::time::sleep(rt.options.dispatcher_idle_sleep).await,
                            Err(e) => {
                                warn!(
                                    target: "duroflow::runtime",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "orchestrator dequeue failed"
                                );
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

    async fn process_orchestrator_item(&self, worker_id: &str, lease: Lease) {
        let instance = lease.item.instance().to_string();
        let kind = lease.item.kind_name();
        debug!(
            target: "duroflow::runtime",
            worker_id = %worker_id,
            instance_id = %instance,
            kind,
            delivery_count = lease.delivery_count,
            "processing orchestrator item"
        );

        let settle = match self.manager.handle(&lease).await {
            Ok(Disposition::Ack) => self.queue.ack(QueueKind::Orchestrator, &lease.token).await,
            Ok(Disposition::Nack(delay)) => self.queue.nack(QueueKind::Orchestrator, &lease.token, delay).await,
            Err(e) if e.is_retryable() => {
                let delay = retry_backoff(lease.delivery_count);
                warn!(
                    target: "duroflow::runtime",
                    worker_id = %worker_id,
                    instance_id = %instance,
                    kind,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient provider error; will retry item"
                );
                self.queue.nack(QueueKind::Orchestrator, &lease.token, delay).await
            }
            Err(e) => {
                error!(
                    target: "duroflow::runtime",
                    worker_id = %worker_id,
                    instance_id = %instance,
                    kind,
                    error = %e,
                    "permanent provider error; failing instance"
                );
                match self.manager.fail_instance(&lease, &e).await {
                    Ok(Disposition::Ack) => self.queue.ack(QueueKind::Orchestrator, &lease.token).await,
                    Ok(Disposition::Nack(delay)) => {
                        self.queue.nack(QueueKind::Orchestrator, &lease.token, delay).await
                    }
                    Err(fail_err) => {
                        let delay = retry_backoff(lease.delivery_count);
                        warn!(
                            target: "duroflow::runtime",
                            worker_id = %worker_id,
                            instance_id = %instance,
                            error = %fail_err,
                            retry_in_ms = delay.as_millis() as u64,
                            "could not record instance failure; will retry item"
                        );
                        self.queue.nack(QueueKind::Orchestrator, &lease.token, delay).await
                    }
                }
            }
        };

        if let Err(e) = settle {
            // lease expired mid-turn; the item comes back and replay dedups it
            warn!(
                target: "duroflow::runtime",
                worker_id = %worker_id,
                instance_id = %instance,
                error = %e,
                "failed to settle orchestrator lease"
            );
        }
    }
}
