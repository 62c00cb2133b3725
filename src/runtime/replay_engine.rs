use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::{TurnMeta, run_turn};
use crate::providers::WorkItem;
use crate::runtime::OrchestrationHandler;
use crate::{AppErrorKind, Command, ErrorDetails, Event, EventKind, ExecutionResult};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// Blocked on outstanding durable calls
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew { input: String, version: Option<String> },
}

impl TurnResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnResult::Continue)
    }
}

/// Replays one generation's history and executes one deterministic
/// orchestration evaluation.
pub struct ReplayEngine {
    pub(crate) instance: String,
    pub(crate) generation: u64,
    /// Events produced by this run, in append order
    pub(crate) history_delta: Vec<Event>,
    /// Commands to dispatch after the delta is persisted
    pub(crate) pending_commands: Vec<Command>,
    pub(crate) baseline_history: Vec<Event>,
    pub(crate) next_event_id: u64,
    /// Set when an incoming completion contradicts history
    pub(crate) abort_error: Option<ErrorDetails>,
}

impl ReplayEngine {
    pub fn new(instance: String, generation: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history
            .last()
            .map(|e| e.event_id + 1)
            .unwrap_or(crate::INITIAL_EVENT_ID);
        Self {
            instance,
            generation,
            history_delta: Vec::new(),
            pending_commands: Vec::new(),
            baseline_history,
            next_event_id,
            abort_error: None,
        }
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    fn push_event(&mut self, source_event_id: Option<u64>, timestamp_ms: u64, kind: EventKind) {
        let event = Event::new(self.next_event_id, source_event_id, timestamp_ms, kind);
        self.next_event_id += 1;
        self.history_delta.push(event);
    }

    /// Whether the baseline already ended this generation.
    pub fn is_generation_closed(&self) -> bool {
        self.baseline_history.last().is_some_and(Event::is_terminal)
    }

    /// `OrchestratorStarted` payload of this generation.
    pub fn started(&self) -> Option<(&str, &str, &str)> {
        self.baseline_history.first().and_then(|e| match &e.kind {
            EventKind::OrchestratorStarted {
                workflow_type,
                version,
                input,
                ..
            } => Some((workflow_type.as_str(), version.as_str(), input.as_str())),
            _ => None,
        })
    }

    /// Stage 1: convert an incoming work item into a history event.
    ///
    /// Items for another generation, duplicates and completions for unknown
    /// ids are dropped. A completion whose kind contradicts its scheduling
    /// event sets `abort_error`.
    pub fn prep_completion(&mut self, item: &WorkItem, now_ms: u64) {
        let (generation, source, kind, expected) = match item {
            WorkItem::ActivityCompleted {
                generation,
                task_id,
                result,
                ..
            } => (
                Some(*generation),
                Some(*task_id),
                EventKind::TaskCompleted { result: result.clone() },
                "TaskScheduled",
            ),
            WorkItem::ActivityFailed {
                generation,
                task_id,
                details,
                attempts,
                ..
            } => (
                Some(*generation),
                Some(*task_id),
                EventKind::TaskFailed {
                    details: details.clone(),
                    attempts: *attempts,
                },
                "TaskScheduled",
            ),
            WorkItem::TimerFired {
                generation,
                timer_id,
                fire_at_ms,
                ..
            } => (
                Some(*generation),
                Some(*timer_id),
                EventKind::TimerFired { fire_at_ms: *fire_at_ms },
                "TimerCreated",
            ),
            WorkItem::SubOrchCompleted {
                parent_generation,
                parent_id,
                result,
                ..
            } => (
                Some(*parent_generation),
                Some(*parent_id),
                EventKind::SubOrchestrationCompleted { result: result.clone() },
                "SubOrchestrationScheduled",
            ),
            WorkItem::SubOrchFailed {
                parent_generation,
                parent_id,
                details,
                ..
            } => (
                Some(*parent_generation),
                Some(*parent_id),
                EventKind::SubOrchestrationFailed {
                    details: details.clone(),
                },
                "SubOrchestrationScheduled",
            ),
            WorkItem::ExternalRaised { name, data, .. } => (
                None,
                None,
                EventKind::EventRaised {
                    name: name.clone(),
                    data: data.clone(),
                },
                "",
            ),
            other => {
                debug!(instance = %self.instance, kind = other.kind_name(), "not a completion; nothing to record");
                return;
            }
        };

        if let Some(g) = generation
            && g != self.generation
        {
            warn!(
                instance = %self.instance,
                generation = self.generation,
                item_generation = g,
                "ignoring completion from another generation"
            );
            return;
        }

        let Some(source) = source else {
            self.push_event(None, now_ms, kind);
            return;
        };

        if self
            .all_events()
            .any(|e| e.is_completion() && e.source_event_id == Some(source))
        {
            warn!(instance = %self.instance, source_event_id = source, "ignoring duplicate completion");
            return;
        }

        let scheduled = self.all_events().find(|e| e.event_id == source).map(|e| e.kind.name());
        match scheduled {
            None => {
                warn!(instance = %self.instance, source_event_id = source, "completion for unknown id; dropping");
            }
            Some(name) if name != expected => {
                self.abort_error = Some(ErrorDetails::nondeterminism(format!(
                    "completion kind mismatch for id={source}, history has '{name}', got '{}'",
                    kind.name()
                )));
            }
            Some(_) => {
                // timers never deliver earlier than their fire time
                let ts = match &kind {
                    EventKind::TimerFired { fire_at_ms } => now_ms.max(*fire_at_ms),
                    _ => now_ms,
                };
                self.push_event(Some(source), ts, kind);
            }
        }
    }

    /// Stage 2: run the orchestration over baseline + delta and append the
    /// events it produced, plus the terminal event if it finished.
    pub fn execute_orchestration(
        &mut self,
        handler: Arc<dyn OrchestrationHandler>,
        meta: TurnMeta,
        now_ms: u64,
    ) -> TurnResult {
        if let Some(err) = self.abort_error.clone() {
            return self.finish(TurnResult::Failed(err), now_ms);
        }

        let Some(input) = self.started().map(|(_, _, input)| input.to_string()) else {
            return self.finish(
                TurnResult::Failed(ErrorDetails::nondeterminism(
                    "history does not begin with OrchestratorStarted",
                )),
                now_ms,
            );
        };

        let mut working_history = self.baseline_history.clone();
        working_history.extend(self.history_delta.iter().cloned());

        let run = catch_unwind(AssertUnwindSafe(|| {
            run_turn(working_history, meta, move |ctx| {
                let h = handler.clone();
                async move { h.invoke(ctx, input).await }
            })
        }));

        let turn = match run {
            Ok(turn) => turn,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return self.finish(
                    TurnResult::Failed(ErrorDetails::Application {
                        kind: AppErrorKind::Panicked,
                        message: msg,
                        retryable: false,
                    }),
                    now_ms,
                );
            }
        };

        if let Some(err) = turn.nondeterminism {
            warn!(instance = %self.instance, generation = self.generation, error = %err, "nondeterminism detected");
            return self.finish(TurnResult::Failed(ErrorDetails::nondeterminism(err)), now_ms);
        }

        let continue_as_new = turn.commands.iter().find_map(|c| match c {
            Command::ContinueAsNew { input, version } => Some(TurnResult::ContinueAsNew {
                input: input.clone(),
                version: version.clone(),
            }),
            _ => None,
        });

        for event in turn.new_events {
            self.next_event_id = self.next_event_id.max(event.event_id + 1);
            self.history_delta.push(event);
        }

        let result = match (turn.output, continue_as_new) {
            (Some(Ok(output)), _) => TurnResult::Completed(output),
            (Some(Err(message)), _) => TurnResult::Failed(ErrorDetails::Application {
                kind: AppErrorKind::OrchestrationFailed,
                message,
                retryable: false,
            }),
            (None, Some(can)) => can,
            (None, None) => TurnResult::Continue,
        };

        // Finished generations only start fire-and-forget work.
        self.pending_commands = turn
            .commands
            .into_iter()
            .filter(|c| match c {
                Command::ScheduleActivity { .. } | Command::ScheduleSubOrchestration { .. } => true,
                Command::ScheduleTimer { .. } | Command::WaitForExternalEvent { .. } => !result.is_terminal(),
                Command::ContinueAsNew { .. } => false,
            })
            .collect();

        self.finish(result, now_ms)
    }

    /// Close the generation as failed without running orchestration code.
    pub fn fail(&mut self, details: ErrorDetails, now_ms: u64) -> TurnResult {
        self.finish(TurnResult::Failed(details), now_ms)
    }

    fn finish(&mut self, result: TurnResult, now_ms: u64) -> TurnResult {
        let terminal = match &result {
            TurnResult::Continue => None,
            TurnResult::Completed(output) => Some(EventKind::ExecutionCompleted {
                result: ExecutionResult::Completed { output: output.clone() },
            }),
            TurnResult::Failed(details) => Some(EventKind::ExecutionCompleted {
                result: ExecutionResult::Failed {
                    details: details.clone(),
                },
            }),
            TurnResult::ContinueAsNew { input, .. } => Some(EventKind::ContinueAsNew { input: input.clone() }),
        };
        if let Some(kind) = terminal {
            self.push_event(None, now_ms, kind);
        }
        result
    }

    pub fn baseline_len(&self) -> usize {
        self.baseline_history.len()
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_commands(&self) -> &[Command] {
        &self.pending_commands
    }

    /// Commands whose scheduling event has no completion yet. Used to repair
    /// a crash between appending history and dispatching work.
    pub fn outstanding_commands(&self) -> Vec<Command> {
        let events: Vec<&Event> = self.all_events().collect();
        events
            .iter()
            .filter(|e| {
                !events
                    .iter()
                    .any(|c| c.is_completion() && c.source_event_id == Some(e.event_id))
            })
            .filter_map(|e| match &e.kind {
                EventKind::TaskScheduled {
                    name,
                    input,
                    retry_policy,
                } => Some(Command::ScheduleActivity {
                    task_id: e.event_id,
                    name: name.clone(),
                    input: input.clone(),
                    retry_policy: retry_policy.clone(),
                }),
                EventKind::TimerCreated { fire_at_ms } => Some(Command::ScheduleTimer {
                    timer_id: e.event_id,
                    fire_at_ms: *fire_at_ms,
                }),
                EventKind::SubOrchestrationScheduled {
                    workflow_type,
                    instance,
                    input,
                } => Some(Command::ScheduleSubOrchestration {
                    id: e.event_id,
                    workflow_type: workflow_type.clone(),
                    version: None,
                    instance: instance.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}
