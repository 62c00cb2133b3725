//! Instance Manager: owns the lifecycle of workflow instances.
//!
//! Every orchestrator-queue item is routed here. The manager takes a
//! per-instance lock, reads the current generation's history, lets the
//! [`ReplayEngine`] turn the item into events and commands, appends the delta
//! with an expected-version check, dispatches outbound work and finally
//! updates the instance record.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use semver::Version;
use tracing::{debug, error, info, warn};

use super::replay_engine::{ReplayEngine, TurnResult};
use super::status::InstanceStatus;
use super::{OrchestrationRegistry, RuntimeOptions};
use crate::context::TurnMeta;
use crate::providers::{HistoryStore, InstanceRecord, Lease, ProviderError, QueueKind, TaskQueue, WorkItem};
use crate::{AppErrorKind, Command, ConfigErrorKind, ErrorDetails, Event, EventKind, ExecutionResult, now_ms};

/// What the dispatcher should do with the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Make the item visible again after the delay.
    Nack(Duration),
}

pub struct InstanceManager {
    store: Arc<dyn HistoryStore>,
    queue: Arc<dyn TaskQueue>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
    busy: Mutex<HashSet<String>>,
}

struct InstanceLock<'a> {
    busy: &'a Mutex<HashSet<String>>,
    instance: String,
}

impl Drop for InstanceLock<'_> {
    fn drop(&mut self) {
        lock_set(self.busy).remove(&self.instance);
    }
}

fn lock_set(busy: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InstanceManager {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        queue: Arc<dyn TaskQueue>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            store,
            queue,
            orchestrations,
            options,
            busy: Mutex::new(HashSet::new()),
        }
    }

    fn try_lock(&self, instance: &str) -> Option<InstanceLock<'_>> {
        if !lock_set(&self.busy).insert(instance.to_string()) {
            return None;
        }
        Some(InstanceLock {
            busy: &self.busy,
            instance: instance.to_string(),
        })
    }

    /// Process one leased orchestrator-queue item.
    pub async fn handle(&self, lease: &Lease) -> Result<Disposition, ProviderError> {
        let item = &lease.item;
        let instance = item.instance();

        let Some(_lock) = self.try_lock(instance) else {
            debug!(
                target: "duroflow::runtime",
                instance_id = %instance,
                kind = item.kind_name(),
                "instance busy; deferring item"
            );
            return Ok(Disposition::Nack(self.options.busy_instance_retry_delay));
        };

        let Some(record) = self.store.read_instance(instance).await? else {
            warn!(target: "duroflow::runtime", instance_id = %instance, kind = item.kind_name(), "work item for unknown instance; dropping");
            return Ok(Disposition::Ack);
        };
        // only a lost lease can leave appended work undispatched; nacks cannot
        let redelivered = lease.redelivered;

        if item.is_control() {
            return self.control(record, item).await;
        }

        match item {
            _ if record.status.is_terminal() => {
                debug!(
                    target: "duroflow::runtime",
                    instance_id = %instance,
                    status = %record.status,
                    kind = item.kind_name(),
                    "instance already finished; dropping item"
                );
                Ok(Disposition::Ack)
            }
            _ if record.status == InstanceStatus::Suspended => {
                Ok(Disposition::Nack(self.options.suspended_redelivery_delay))
            }
            WorkItem::StartOrchestration { .. } => {
                let input = record.input.clone();
                let version = (!record.version.is_empty()).then(|| record.version.clone());
                self.begin_generation(record, crate::INITIAL_GENERATION, input, version, redelivered)
                    .await
            }
            WorkItem::ContinueAsNew {
                generation,
                input,
                version,
                ..
            } => {
                self.begin_generation(record, *generation, input.clone(), version.clone(), redelivered)
                    .await
            }
            WorkItem::ActivityExecute { .. } => {
                error!(target: "duroflow::runtime", instance_id = %instance, "activity item on the orchestrator queue; dropping");
                Ok(Disposition::Ack)
            }
            // raised between generations: deliver once the next one is running
            WorkItem::ExternalRaised { .. }
                if matches!(record.status, InstanceStatus::Pending | InstanceStatus::ContinuedAsNew) =>
            {
                Ok(Disposition::Nack(self.options.busy_instance_retry_delay))
            }
            _ => {
                let generation = record.generation;
                self.advance(record, generation, Some(item), redelivered).await
            }
        }
    }

    async fn control(&self, record: InstanceRecord, item: &WorkItem) -> Result<Disposition, ProviderError> {
        match item {
            WorkItem::Terminate { reason, .. } => self.terminate(record, reason).await,
            WorkItem::Suspend { .. } => self.set_status(record, InstanceStatus::Suspended).await,
            WorkItem::Resume { .. } => self.set_status(record, InstanceStatus::Running).await,
            other => {
                error!(target: "duroflow::runtime", instance_id = %record.instance_id, kind = other.kind_name(), "not a control item; dropping");
                Ok(Disposition::Ack)
            }
        }
    }

    /// Fail the instance an item belongs to after a provider error that
    /// retrying cannot fix, so it does not sit in a non-terminal status with
    /// nothing left to drive it.
    pub async fn fail_instance(&self, lease: &Lease, cause: &ProviderError) -> Result<Disposition, ProviderError> {
        let instance = lease.item.instance();
        let Some(_lock) = self.try_lock(instance) else {
            return Ok(Disposition::Nack(self.options.busy_instance_retry_delay));
        };
        let Some(mut record) = self.store.read_instance(instance).await? else {
            return Ok(Disposition::Ack);
        };
        if record.status.is_terminal() {
            return Ok(Disposition::Ack);
        }
        let generation = record.generation;
        self.apply_result(&mut record, generation, &TurnResult::Failed(cause.to_error_details()))
            .await?;
        Ok(Disposition::Ack)
    }

    /// Write `OrchestratorStarted` for `generation` (idempotently) and run
    /// its first turn.
    async fn begin_generation(
        &self,
        mut record: InstanceRecord,
        generation: u64,
        input: String,
        requested_version: Option<String>,
        redelivered: bool,
    ) -> Result<Disposition, ProviderError> {
        let id = record.instance_id.clone();
        if generation < record.generation {
            debug!(target: "duroflow::runtime", instance_id = %id, generation, "stale generation start; dropping");
            return Ok(Disposition::Ack);
        }

        let history = self.store.read(&id, generation).await?;
        if history.is_empty() {
            let resolved = match &requested_version {
                Some(v) => Version::parse(v)
                    .ok()
                    .filter(|v| self.orchestrations.resolve_handler_exact(&record.workflow_type, v).is_some()),
                None => self
                    .orchestrations
                    .resolve_handler(&record.workflow_type)
                    .map(|(v, _)| v),
            };
            let Some(version) = resolved else {
                warn!(
                    target: "duroflow::runtime",
                    instance_id = %id,
                    workflow_type = %record.workflow_type,
                    requested_version = ?requested_version,
                    "orchestration not registered; failing instance"
                );
                let details = ErrorDetails::Configuration {
                    kind: ConfigErrorKind::UnregisteredOrchestration,
                    resource: record.workflow_type.clone(),
                    message: requested_version.map(|v| format!("version {v} is not registered")),
                };
                record.generation = generation;
                self.apply_result(&mut record, generation, &TurnResult::Failed(details))
                    .await?;
                return Ok(Disposition::Ack);
            };

            let started = Event::new(
                crate::INITIAL_EVENT_ID,
                None,
                now_ms(),
                EventKind::OrchestratorStarted {
                    workflow_type: record.workflow_type.clone(),
                    version: version.to_string(),
                    input,
                    parent_instance: record.parent_instance_id.clone(),
                    parent_id: record.parent_event_id,
                },
            );
            match self.store.append(&id, generation, 0, vec![started]).await {
                Ok(()) => info!(
                    target: "duroflow::runtime",
                    instance_id = %id,
                    generation,
                    workflow_type = %record.workflow_type,
                    version = %version,
                    "orchestration started"
                ),
                Err(e) if e.is_version_conflict() => {
                    debug!(target: "duroflow::runtime", instance_id = %id, generation, "generation already started");
                }
                Err(e) => return Err(e),
            }
        }

        self.advance(record, generation, None, redelivered).await
    }

    /// Run one replay turn for `generation`, optionally recording `trigger`
    /// first, and commit the result. Re-reads and replays on append conflicts.
    async fn advance(
        &self,
        mut record: InstanceRecord,
        generation: u64,
        trigger: Option<&WorkItem>,
        redelivered: bool,
    ) -> Result<Disposition, ProviderError> {
        let id = record.instance_id.clone();

        for attempt in 1..=self.options.max_append_attempts.max(1) {
            let history = self.store.read(&id, generation).await?;
            let mut engine = ReplayEngine::new(id.clone(), generation, history);

            if engine.is_generation_closed() {
                self.reconcile_closed(&mut record, &engine).await?;
                return Ok(Disposition::Ack);
            }
            let Some((workflow_type, version, input)) = engine
                .started()
                .map(|(w, v, i)| (w.to_string(), v.to_string(), i.to_string()))
            else {
                warn!(target: "duroflow::runtime", instance_id = %id, generation, "generation has no history; dropping item");
                return Ok(Disposition::Ack);
            };

            let now = now_ms();
            if let Some(item) = trigger {
                engine.prep_completion(item, now);
            }

            let handler = Version::parse(&version)
                .ok()
                .and_then(|v| self.orchestrations.resolve_handler_exact(&workflow_type, &v));
            let result = match handler {
                Some(handler) => {
                    let meta = TurnMeta {
                        instance_id: id.clone(),
                        generation,
                        workflow_type: workflow_type.clone(),
                        version: version.clone(),
                    };
                    engine.execute_orchestration(handler, meta, now)
                }
                None => engine.fail(
                    ErrorDetails::Configuration {
                        kind: ConfigErrorKind::UnregisteredOrchestration,
                        resource: workflow_type.clone(),
                        message: Some(format!("pinned version {version} is not registered")),
                    },
                    now,
                ),
            };

            let delta = engine.history_delta().to_vec();
            let mut commands = engine.pending_commands().to_vec();
            if redelivered {
                for cmd in engine.outstanding_commands() {
                    if !commands.contains(&cmd) {
                        commands.push(cmd);
                    }
                }
            }

            if !delta.is_empty() {
                match self.store.append(&id, generation, engine.baseline_len(), delta).await {
                    Ok(()) => {}
                    Err(e) if e.is_version_conflict() => {
                        debug!(
                            target: "duroflow::runtime",
                            instance_id = %id,
                            generation,
                            attempt,
                            "history changed underneath; replaying"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            debug!(
                target: "duroflow::runtime",
                instance_id = %id,
                generation,
                workflow_type = %workflow_type,
                appended = engine.history_delta().len(),
                commands = commands.len(),
                result = ?result,
                "turn committed"
            );

            self.dispatch(&id, generation, &commands).await?;
            record.version = version;
            record.input = input;
            self.apply_result(&mut record, generation, &result).await?;
            return Ok(Disposition::Ack);
        }

        warn!(
            target: "duroflow::runtime",
            instance_id = %id,
            generation,
            attempts = self.options.max_append_attempts,
            "append conflicts exhausted; deferring item"
        );
        Ok(Disposition::Nack(self.options.busy_instance_retry_delay))
    }

    /// Materialize commands into outbound work.
    async fn dispatch(&self, instance: &str, generation: u64, commands: &[Command]) -> Result<(), ProviderError> {
        for command in commands {
            match command {
                Command::ScheduleActivity {
                    task_id,
                    name,
                    input,
                    retry_policy,
                } => {
                    self.queue
                        .enqueue(
                            QueueKind::Worker,
                            WorkItem::ActivityExecute {
                                instance: instance.to_string(),
                                generation,
                                task_id: *task_id,
                                name: name.clone(),
                                input: input.clone(),
                                attempt: 1,
                                retry_policy: retry_policy.clone(),
                            },
                            Duration::ZERO,
                        )
                        .await?;
                }
                Command::ScheduleTimer { timer_id, fire_at_ms } => {
                    let delay = Duration::from_millis(fire_at_ms.saturating_sub(now_ms()));
                    self.queue
                        .enqueue(
                            QueueKind::Orchestrator,
                            WorkItem::TimerFired {
                                instance: instance.to_string(),
                                generation,
                                timer_id: *timer_id,
                                fire_at_ms: *fire_at_ms,
                            },
                            delay,
                        )
                        .await?;
                }
                Command::ScheduleSubOrchestration {
                    id,
                    workflow_type,
                    version,
                    instance: child,
                    input,
                } => self.start_child(instance, generation, *id, workflow_type, version.as_deref(), child, input).await?,
                Command::WaitForExternalEvent { .. } | Command::ContinueAsNew { .. } => {}
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_child(
        &self,
        parent: &str,
        parent_generation: u64,
        parent_event_id: u64,
        workflow_type: &str,
        version: Option<&str>,
        child: &str,
        input: &str,
    ) -> Result<(), ProviderError> {
        let mut record = InstanceRecord::new(child, workflow_type, input);
        record.version = version.unwrap_or_default().to_string();
        record.parent_instance_id = Some(parent.to_string());
        record.parent_generation = Some(parent_generation);
        record.parent_event_id = Some(parent_event_id);

        match self.store.create_instance(record).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                let existing = self.store.read_instance(child).await?;
                let ours = existing.as_ref().is_some_and(|r| {
                    r.parent_instance_id.as_deref() == Some(parent) && r.parent_event_id == Some(parent_event_id)
                });
                if !ours {
                    warn!(target: "duroflow::runtime", instance_id = %parent, child_instance = %child, "child instance id already in use");
                    return self
                        .queue
                        .enqueue(
                            QueueKind::Orchestrator,
                            WorkItem::SubOrchFailed {
                                parent_instance: parent.to_string(),
                                parent_generation,
                                parent_id: parent_event_id,
                                details: ErrorDetails::Application {
                                    kind: AppErrorKind::ChildFailed,
                                    message: format!("instance id already in use: {child}"),
                                    retryable: false,
                                },
                            },
                            Duration::ZERO,
                        )
                        .await;
                }
            }
            Err(e) => return Err(e),
        }

        self.queue
            .enqueue(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: child.to_string(),
                },
                Duration::ZERO,
            )
            .await
    }

    /// Bring the record in line with a generation whose history is already
    /// closed (a crash after append, or a duplicate item).
    async fn reconcile_closed(&self, record: &mut InstanceRecord, engine: &ReplayEngine) -> Result<(), ProviderError> {
        let generation = engine.generation;
        let already = record.generation > generation
            || record.status.is_terminal()
            || (record.status == InstanceStatus::ContinuedAsNew && record.generation == generation);
        if already {
            return Ok(());
        }
        let Some(last) = engine.baseline_history.last() else {
            return Ok(());
        };
        match &last.kind {
            EventKind::ExecutionCompleted {
                result: ExecutionResult::Terminated { reason },
            } => self.finish_terminated(record, reason).await,
            EventKind::ExecutionCompleted {
                result: ExecutionResult::Completed { output },
            } => {
                self.apply_result(record, generation, &TurnResult::Completed(output.clone()))
                    .await
            }
            EventKind::ExecutionCompleted {
                result: ExecutionResult::Failed { details },
            } => {
                self.apply_result(record, generation, &TurnResult::Failed(details.clone()))
                    .await
            }
            EventKind::ContinueAsNew { input } => {
                let result = TurnResult::ContinueAsNew {
                    input: input.clone(),
                    version: None,
                };
                self.apply_result(record, generation, &result).await
            }
            _ => Ok(()),
        }
    }

    /// Reflect a committed turn in the instance record and perform the
    /// follow-up work a terminal result implies.
    async fn apply_result(
        &self,
        record: &mut InstanceRecord,
        generation: u64,
        result: &TurnResult,
    ) -> Result<(), ProviderError> {
        let id = record.instance_id.clone();
        if matches!(record.status, InstanceStatus::Pending | InstanceStatus::ContinuedAsNew)
            && !matches!(result, TurnResult::Failed(_) if record.status == InstanceStatus::Pending)
        {
            transition(record, InstanceStatus::Running);
        }
        record.generation = generation;

        match result {
            TurnResult::Continue => {}
            TurnResult::Completed(output) => {
                transition(record, InstanceStatus::Completed);
                record.output = Some(output.clone());
                info!(target: "duroflow::runtime", instance_id = %id, generation, "orchestration completed");
                self.notify_parent(record, Ok(output.clone())).await?;
            }
            TurnResult::Failed(details) => {
                transition(record, InstanceStatus::Failed);
                record.output = Some(details.payload());
                record.failure = Some(details.clone());
                warn!(
                    target: "duroflow::runtime",
                    instance_id = %id,
                    generation,
                    category = details.category(),
                    error = %details.display_message(),
                    "orchestration failed"
                );
                self.notify_parent(record, Err(details.clone())).await?;
            }
            TurnResult::ContinueAsNew { input, version } => {
                self.queue
                    .enqueue(
                        QueueKind::Orchestrator,
                        WorkItem::ContinueAsNew {
                            instance: id.clone(),
                            generation: generation + 1,
                            input: input.clone(),
                            version: version.clone(),
                        },
                        Duration::ZERO,
                    )
                    .await?;
                transition(record, InstanceStatus::ContinuedAsNew);
                debug!(target: "duroflow::runtime", instance_id = %id, generation, "continued as new");
            }
        }

        record.last_updated_at_ms = now_ms();
        self.store.update_instance(record.clone()).await
    }

    async fn notify_parent(&self, record: &InstanceRecord, outcome: Result<String, ErrorDetails>) -> Result<(), ProviderError> {
        let (Some(parent), Some(parent_generation), Some(parent_id)) = (
            record.parent_instance_id.clone(),
            record.parent_generation,
            record.parent_event_id,
        ) else {
            return Ok(());
        };
        let item = match outcome {
            Ok(result) => WorkItem::SubOrchCompleted {
                parent_instance: parent,
                parent_generation,
                parent_id,
                result,
            },
            Err(details) => WorkItem::SubOrchFailed {
                parent_instance: parent,
                parent_generation,
                parent_id,
                details: ErrorDetails::Application {
                    kind: AppErrorKind::ChildFailed,
                    message: details.display_message(),
                    retryable: false,
                },
            },
        };
        self.queue.enqueue(QueueKind::Orchestrator, item, Duration::ZERO).await
    }

    /// Close the current generation as terminated without running
    /// orchestration code, and cascade to running children.
    async fn terminate(&self, mut record: InstanceRecord, reason: &str) -> Result<Disposition, ProviderError> {
        let id = record.instance_id.clone();
        if record.status.is_terminal() {
            return Ok(Disposition::Ack);
        }
        let generation = record.generation;

        for _ in 0..self.options.max_append_attempts.max(1) {
            let history = self.store.read(&id, generation).await?;
            let engine = ReplayEngine::new(id.clone(), generation, history);

            if engine.is_generation_closed() {
                // between generations there is nothing to close
                let between = matches!(
                    engine.baseline_history.last().map(|e| &e.kind),
                    Some(EventKind::ContinueAsNew { .. })
                );
                if between {
                    self.finish_terminated(&mut record, reason).await?;
                } else {
                    self.reconcile_closed(&mut record, &engine).await?;
                }
                return Ok(Disposition::Ack);
            }

            if engine.baseline_len() > 0 {
                let terminated = Event::new(
                    engine.next_event_id,
                    None,
                    now_ms(),
                    EventKind::ExecutionCompleted {
                        result: ExecutionResult::Terminated {
                            reason: reason.to_string(),
                        },
                    },
                );
                match self.store.append(&id, generation, engine.baseline_len(), vec![terminated]).await {
                    Ok(()) => {}
                    Err(e) if e.is_version_conflict() => continue,
                    Err(e) => return Err(e),
                }

                for command in engine.outstanding_commands() {
                    if let Command::ScheduleSubOrchestration { instance: child, .. } = command {
                        self.queue
                            .enqueue(
                                QueueKind::Orchestrator,
                                WorkItem::Terminate {
                                    instance: child,
                                    reason: format!("parent {id} terminated: {reason}"),
                                },
                                Duration::ZERO,
                            )
                            .await?;
                    }
                }
            }

            self.finish_terminated(&mut record, reason).await?;
            return Ok(Disposition::Ack);
        }

        Ok(Disposition::Nack(self.options.busy_instance_retry_delay))
    }

    async fn finish_terminated(&self, record: &mut InstanceRecord, reason: &str) -> Result<(), ProviderError> {
        transition(record, InstanceStatus::Terminated);
        record.output = Some(reason.to_string());
        record.last_updated_at_ms = now_ms();
        info!(target: "duroflow::runtime", instance_id = %record.instance_id, reason = %reason, "orchestration terminated");
        self.notify_parent(
            record,
            Err(ErrorDetails::Application {
                kind: AppErrorKind::Terminated,
                message: reason.to_string(),
                retryable: false,
            }),
        )
        .await?;
        self.store.update_instance(record.clone()).await
    }

    /// Suspend or resume. History is not touched.
    async fn set_status(&self, mut record: InstanceRecord, next: InstanceStatus) -> Result<Disposition, ProviderError> {
        // not started yet, or between generations: apply once running
        if matches!(record.status, InstanceStatus::Pending | InstanceStatus::ContinuedAsNew) {
            return Ok(Disposition::Nack(self.options.busy_instance_retry_delay));
        }
        if record.status == next {
            return Ok(Disposition::Ack);
        }
        let allowed = match next {
            InstanceStatus::Running => record.status == InstanceStatus::Suspended,
            _ => record.status.can_transition_to(next),
        };
        if !allowed {
            debug!(
                target: "duroflow::runtime",
                instance_id = %record.instance_id,
                from = %record.status,
                to = %next,
                "ignoring control request in current status"
            );
            return Ok(Disposition::Ack);
        }
        record.status = next;
        record.last_updated_at_ms = now_ms();
        info!(target: "duroflow::runtime", instance_id = %record.instance_id, status = %next, "instance status changed");
        self.store.update_instance(record).await?;
        Ok(Disposition::Ack)
    }
}

fn transition(record: &mut InstanceRecord, next: InstanceStatus) {
    if record.status != next && !record.status.can_transition_to(next) {
        warn!(
            target: "duroflow::runtime",
            instance_id = %record.instance_id,
            from = %record.status,
            to = %next,
            "unexpected status transition"
        );
    }
    record.status = next;
}
