//! Deterministic orchestration context and the single-turn replay driver.
//!
//! Orchestration code only ever talks to [`OrchestrationContext`]. Each
//! awaitable call becomes a [`DurableFuture`] that claims the next scheduling
//! event in history on first poll, or records a new one (plus a [`Command`])
//! when history is exhausted. [`run_turn`] polls the orchestration exactly
//! once against a fixed history and reports what it asked for.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ::futures::FutureExt;

use crate::_typed_codec::{Codec, Json};
use crate::futures::{DurableFuture, DurableOutput, JoinFuture, Kind, SelectFuture};
use crate::{Command, Event, EventKind, RetryPolicy};

/// Identity of the execution being replayed.
#[derive(Debug, Clone, Default)]
pub struct TurnMeta {
    pub instance_id: String,
    pub generation: u64,
    pub workflow_type: String,
    pub version: String,
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    baseline_len: usize,
    // Positions in `history` of replayed scheduling events, in order.
    schedule_positions: Vec<usize>,
    pub(crate) next_schedule: usize,
    // source_event_id -> position of its completion
    completions: HashMap<u64, usize>,
    // external event name -> positions of raised events, arrival order
    raised: HashMap<String, Vec<usize>>,
    external_ordinals: HashMap<String, usize>,
    next_event_id: u64,
    pub(crate) commands: Vec<Command>,
    pub(crate) nondeterminism: Option<String>,
    pub(crate) logical_time_ms: u64,
    continue_as_new_requested: bool,
    pub(crate) meta: TurnMeta,
}

impl CtxInner {
    fn new(history: Vec<Event>, meta: TurnMeta) -> Self {
        let mut schedule_positions = Vec::new();
        let mut completions = HashMap::new();
        let mut raised: HashMap<String, Vec<usize>> = HashMap::new();
        let mut logical_time_ms = 0;

        for (pos, event) in history.iter().enumerate() {
            if event.is_scheduling() {
                schedule_positions.push(pos);
            }
            match &event.kind {
                EventKind::OrchestratorStarted { .. } => logical_time_ms = event.timestamp_ms,
                EventKind::EventRaised { name, .. } => raised.entry(name.clone()).or_default().push(pos),
                _ if event.is_completion() => {
                    if let Some(source) = event.source_event_id {
                        // first completion wins; later duplicates are never delivered
                        completions.entry(source).or_insert(pos);
                    }
                }
                _ => {}
            }
        }

        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(crate::INITIAL_EVENT_ID);
        let baseline_len = history.len();

        Self {
            history,
            baseline_len,
            schedule_positions,
            next_schedule: 0,
            completions,
            raised,
            external_ordinals: HashMap::new(),
            next_event_id,
            commands: Vec::new(),
            nondeterminism: None,
            logical_time_ms,
            continue_as_new_requested: false,
            meta,
        }
    }

    /// Next replayed scheduling event not yet claimed by orchestration code.
    pub(crate) fn next_scheduled_event(&self) -> Option<&Event> {
        self.schedule_positions
            .get(self.next_schedule)
            .and_then(|pos| self.history.get(*pos))
    }

    pub(crate) fn unclaimed_schedules(&self) -> usize {
        self.schedule_positions.len().saturating_sub(self.next_schedule)
    }

    pub(crate) fn allocate_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    pub(crate) fn push_new_event(&mut self, event: Event) {
        self.history.push(event);
    }

    pub(crate) fn next_external_ordinal(&mut self, name: &str) -> usize {
        let counter = self.external_ordinals.entry(name.to_string()).or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        ordinal
    }

    pub(crate) fn completion_for(&self, source_event_id: u64) -> Option<&Event> {
        self.completions
            .get(&source_event_id)
            .and_then(|pos| self.history.get(*pos))
    }

    pub(crate) fn raised_event(&self, name: &str, ordinal: usize) -> Option<&Event> {
        self.raised
            .get(name)
            .and_then(|positions| positions.get(ordinal))
            .and_then(|pos| self.history.get(*pos))
    }

    pub(crate) fn event_by_id(&self, event_id: u64) -> Option<&Event> {
        self.history.iter().rev().find(|e| e.event_id == event_id)
    }

    /// Advance logical time when a completion is handed to orchestration code.
    pub(crate) fn deliver(&mut self, timestamp_ms: u64) {
        self.logical_time_ms = self.logical_time_ms.max(timestamp_ms);
    }

    fn is_replaying(&self) -> bool {
        self.next_schedule < self.schedule_positions.len()
    }

    fn request_continue_as_new(&mut self, input: String, version: Option<String>) {
        if self.continue_as_new_requested {
            return;
        }
        self.continue_as_new_requested = true;
        self.commands.push(Command::ContinueAsNew { input, version });
    }

    fn new_events(&self) -> Vec<Event> {
        self.history[self.baseline_len..].to_vec()
    }
}

/// User-facing orchestration context. Cheap to clone; all clones share the
/// same replay state.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context over an existing history.
    pub fn new(history: Vec<Event>, meta: TurnMeta) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, meta))),
        }
    }

    // A panic in orchestration code may poison the lock; replay state stays
    // consistent because every mutation completes before user code resumes.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().meta.instance_id.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().meta.generation
    }

    pub fn workflow_type(&self) -> String {
        self.lock().meta.workflow_type.clone()
    }

    /// Version this instance is pinned to.
    pub fn version(&self) -> String {
        self.lock().meta.version.clone()
    }

    /// Deterministic logical time in milliseconds since the epoch: the
    /// generation start time, advanced by each completion delivered so far.
    pub fn current_time_ms(&self) -> u64 {
        self.lock().logical_time_ms
    }

    /// True while orchestration code is re-executing steps already in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn call_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::Activity {
                name: name.into(),
                input: input.into(),
                retry_policy: None,
            },
        )
    }

    /// Schedule an activity that the executor retries per `policy` before
    /// reporting a failure.
    pub fn call_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::Activity {
                name: name.into(),
                input: input.into(),
                retry_policy: Some(policy),
            },
        )
    }

    /// Typed activity call: serializes `input` and decodes the result.
    pub fn call_activity_typed<N, In, Out>(
        &self,
        name: N,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + Send + use<N, In, Out>
    where
        N: Into<String>,
        In: serde::Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let name = name.into();
        let encoded = Json::encode(input);
        let ctx = self.clone();
        async move {
            let payload = encoded?;
            let raw = ctx.call_activity(name, payload).into_activity().await?;
            Json::decode::<Out>(&raw)
        }
    }

    /// Durable timer firing `delay` after the current logical time.
    pub fn create_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::Timer {
                delay_ms: delay.as_millis() as u64,
            },
        )
    }

    /// Wait for an external event by name. Events raised before the wait are
    /// buffered in history and delivered in arrival order.
    pub fn wait_for_external_event(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::External { name: name.into() })
    }

    /// Start a child workflow with a deterministic instance id derived from
    /// this instance and the scheduling sequence number.
    pub fn call_child_workflow(&self, workflow_type: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::SubOrch {
                workflow_type: workflow_type.into(),
                version: None,
                instance: None,
                input: input.into(),
            },
        )
    }

    pub fn call_child_workflow_with_id(
        &self,
        workflow_type: impl Into<String>,
        instance_id: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::SubOrch {
                workflow_type: workflow_type.into(),
                version: None,
                instance: Some(instance_id.into()),
                input: input.into(),
            },
        )
    }

    /// Child workflow pinned to a specific registered version.
    pub fn call_child_workflow_versioned(
        &self,
        workflow_type: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::SubOrch {
                workflow_type: workflow_type.into(),
                version: Some(version.into()),
                instance: None,
                input: input.into(),
            },
        )
    }

    /// Resolve once every future has completed; results follow the order of
    /// `futures`, not completion order.
    pub fn when_all(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(self.clone(), futures)
    }

    /// Resolve with `(index, output)` of the first future to complete. The
    /// others are left outstanding.
    pub fn when_any(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(self.clone(), futures)
    }

    /// Replay-safe GUID, recorded in history on first execution.
    pub fn new_guid(&self) -> impl Future<Output = String> + Send + use<> {
        let fut = DurableFuture::new(
            self.clone(),
            Kind::System {
                op: crate::SYSCALL_OP_GUID.to_string(),
            },
        );
        async move {
            match fut.await {
                DurableOutput::System(value) => value,
                _ => String::new(),
            }
        }
    }

    /// Replay-safe wall-clock reading, recorded in history on first execution.
    pub fn utc_now_ms(&self) -> impl Future<Output = u64> + Send + use<> {
        let fut = DurableFuture::new(
            self.clone(),
            Kind::System {
                op: crate::SYSCALL_OP_UTCNOW_MS.to_string(),
            },
        );
        async move {
            match fut.await {
                DurableOutput::System(value) => value.parse().unwrap_or(0),
                _ => 0,
            }
        }
    }

    /// End this generation and restart the instance with `input` and an empty
    /// history. The returned future never resolves; return it from the
    /// orchestration.
    pub fn continue_as_new<I: Into<String>>(&self, input: I) -> impl Future<Output = Result<String, String>> + Send + use<I> {
        self.lock().request_continue_as_new(input.into(), None);
        ::futures::future::pending()
    }

    /// `continue_as_new` onto a specific orchestration version.
    pub fn continue_as_new_versioned<V: Into<String>, I: Into<String>>(
        &self,
        version: V,
        input: I,
    ) -> impl Future<Output = Result<String, String>> + Send + use<V, I> {
        self.lock()
            .request_continue_as_new(input.into(), Some(version.into()));
        ::futures::future::pending()
    }

    pub fn continue_as_new_typed<In: serde::Serialize>(
        &self,
        input: &In,
    ) -> impl Future<Output = Result<String, String>> + Send + use<In> {
        let encoded = Json::encode(input);
        let ctx = self.clone();
        async move {
            let payload = encoded?;
            ctx.continue_as_new(payload).await
        }
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(tracing::Level::INFO, message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(tracing::Level::WARN, message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(tracing::Level::ERROR, message.into());
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace(tracing::Level::DEBUG, message.into());
    }

    // Logged only on first execution of the surrounding code, never on replay.
    fn trace(&self, level: tracing::Level, message: String) {
        let (replaying, meta) = {
            let inner = self.lock();
            (inner.is_replaying(), inner.meta.clone())
        };
        if replaying {
            return;
        }
        match level {
            tracing::Level::ERROR => tracing::error!(
                target: "duroflow::orchestration",
                instance_id = %meta.instance_id,
                generation = meta.generation,
                workflow_type = %meta.workflow_type,
                "{}", message
            ),
            tracing::Level::WARN => tracing::warn!(
                target: "duroflow::orchestration",
                instance_id = %meta.instance_id,
                generation = meta.generation,
                workflow_type = %meta.workflow_type,
                "{}", message
            ),
            tracing::Level::DEBUG | tracing::Level::TRACE => tracing::debug!(
                target: "duroflow::orchestration",
                instance_id = %meta.instance_id,
                generation = meta.generation,
                workflow_type = %meta.workflow_type,
                "{}", message
            ),
            _ => tracing::info!(
                target: "duroflow::orchestration",
                instance_id = %meta.instance_id,
                generation = meta.generation,
                workflow_type = %meta.workflow_type,
                "{}", message
            ),
        }
    }
}

/// What one replay pass produced.
#[derive(Debug)]
pub struct TurnOutput<O> {
    /// Working history: the input history plus `new_events`.
    pub history: Vec<Event>,
    /// Scheduling events recorded by this pass, not yet persisted.
    pub new_events: Vec<Event>,
    /// Commands to materialize once `new_events` are persisted.
    pub commands: Vec<Command>,
    /// Set when the orchestration function returned.
    pub output: Option<O>,
    /// Set when the code diverged from history.
    pub nondeterminism: Option<String>,
}

impl<O> TurnOutput<O> {
    pub fn continue_as_new(&self) -> Option<(&str, Option<&str>)> {
        self.commands.iter().find_map(|c| match c {
            Command::ContinueAsNew { input, version } => Some((input.as_str(), version.as_deref())),
            _ => None,
        })
    }
}

/// Poll the orchestration once against `history`.
///
/// The orchestration runs until every path is blocked on an unresolved
/// durable call or it returns. Replaying the same history always yields the
/// same commands.
pub fn run_turn<O, F>(history: Vec<Event>, meta: TurnMeta, orchestrator: impl FnOnce(OrchestrationContext) -> F) -> TurnOutput<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history, meta);
    let output = orchestrator(ctx.clone()).now_or_never();

    let mut inner = ctx.lock();
    let mut nondeterminism = inner.nondeterminism.take();
    let finished = output.is_some() || inner.continue_as_new_requested;
    if nondeterminism.is_none() && finished && inner.unclaimed_schedules() > 0 {
        let next = inner
            .next_scheduled_event()
            .map(|e| e.kind.name())
            .unwrap_or("unknown");
        nondeterminism = Some(format!(
            "orchestration finished with {} scheduled operation(s) in history it never reached (next: {next})",
            inner.unclaimed_schedules()
        ));
    }

    TurnOutput {
        new_events: inner.new_events(),
        history: std::mem::take(&mut inner.history),
        commands: std::mem::take(&mut inner.commands),
        output,
        nondeterminism,
    }
}
