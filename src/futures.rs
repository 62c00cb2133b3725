use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::context::{CtxInner, OrchestrationContext};
use crate::{Command, Event, EventKind, RetryPolicy};

/// Output of a resolved [`DurableFuture`].
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
    System(String),
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    Activity {
        name: String,
        input: String,
        retry_policy: Option<RetryPolicy>,
    },
    Timer {
        delay_ms: u64,
    },
    External {
        name: String,
    },
    SubOrch {
        workflow_type: String,
        version: Option<String>,
        instance: Option<String>,
        input: String,
    },
    System {
        op: String,
    },
}

impl Kind {
    fn describe(&self) -> String {
        match self {
            Kind::Activity { name, input, .. } => format!("TaskScheduled('{name}', '{input}')"),
            Kind::Timer { delay_ms } => format!("TimerCreated(+{delay_ms}ms)"),
            Kind::External { name } => format!("EventSubscribed('{name}')"),
            Kind::SubOrch {
                workflow_type, input, ..
            } => format!("SubOrchestrationScheduled('{workflow_type}', '{input}')"),
            Kind::System { op } => format!("SystemCall('{op}')"),
        }
    }

    /// Check a replayed scheduling event against what the code asked for.
    fn check_replay(&self, recorded: &EventKind) -> Result<(), String> {
        let matches = match (self, recorded) {
            (Kind::Activity { name, input, .. }, EventKind::TaskScheduled { name: n, input: i, .. }) => {
                name == n && input == i
            }
            // fire time depends on logical time, which is itself replayed
            (Kind::Timer { .. }, EventKind::TimerCreated { .. }) => true,
            (Kind::External { name }, EventKind::EventSubscribed { name: n }) => name == n,
            (
                Kind::SubOrch {
                    workflow_type,
                    instance,
                    input,
                    ..
                },
                EventKind::SubOrchestrationScheduled {
                    workflow_type: w,
                    instance: inst,
                    input: i,
                },
            ) => workflow_type == w && input == i && instance.as_ref().is_none_or(|explicit| explicit == inst),
            (Kind::System { op }, EventKind::SystemCall { op: o, .. }) => op == o,
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(format!(
                "schedule order mismatch: history has {} but code scheduled {}",
                describe_recorded(recorded),
                self.describe()
            ))
        }
    }
}

fn describe_recorded(kind: &EventKind) -> String {
    match kind {
        EventKind::TaskScheduled { name, input, .. } => format!("TaskScheduled('{name}', '{input}')"),
        EventKind::TimerCreated { fire_at_ms } => format!("TimerCreated(@{fire_at_ms})"),
        EventKind::EventSubscribed { name } => format!("EventSubscribed('{name}')"),
        EventKind::SubOrchestrationScheduled {
            workflow_type, input, ..
        } => format!("SubOrchestrationScheduled('{workflow_type}', '{input}')"),
        EventKind::SystemCall { op, .. } => format!("SystemCall('{op}')"),
        other => other.name().to_string(),
    }
}

#[derive(Debug, Clone)]
struct Claim {
    event_id: u64,
    external_ordinal: Option<usize>,
}

// (completion event id, completion timestamp, output)
type Resolved = (u64, u64, DurableOutput);

/// Handle for one durable operation. Claims its scheduling event in history
/// on first poll and resolves once the matching completion is present.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    claim: Option<Claim>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self { ctx, kind, claim: None }
    }

    /// Claim (if not yet claimed) and look up the completion without
    /// delivering it.
    fn resolve(&mut self, inner: &mut CtxInner) -> Option<Resolved> {
        if self.claim.is_none() {
            self.claim = claim(&self.kind, inner);
        }
        let claim = self.claim.as_ref()?;
        peek(&self.kind, claim, inner)
    }

    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> + Send {
        async move {
            match self.await {
                DurableOutput::Activity(result) => result,
                other => Err(format!("expected activity result, got {other:?}")),
            }
        }
    }

    pub fn into_activity_typed<T: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<T, String>> + Send {
        use crate::_typed_codec::{Codec, Json};
        async move {
            let raw = self.into_activity().await?;
            Json::decode::<T>(&raw)
        }
    }

    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = self.await;
        }
    }

    /// Await an external event's payload.
    pub fn into_event(self) -> impl Future<Output = Result<String, String>> + Send {
        async move {
            match self.await {
                DurableOutput::External(data) => Ok(data),
                other => Err(format!("expected external event, got {other:?}")),
            }
        }
    }

    pub fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> impl Future<Output = Result<T, String>> + Send {
        use crate::_typed_codec::{Codec, Json};
        async move {
            let raw = self.into_event().await?;
            Json::decode::<T>(&raw)
        }
    }

    pub fn into_sub_orchestration(self) -> impl Future<Output = Result<String, String>> + Send {
        async move {
            match self.await {
                DurableOutput::SubOrchestration(result) => result,
                other => Err(format!("expected sub-orchestration result, got {other:?}")),
            }
        }
    }

    pub fn into_sub_orchestration_typed<T: serde::de::DeserializeOwned>(
        self,
    ) -> impl Future<Output = Result<T, String>> + Send {
        use crate::_typed_codec::{Codec, Json};
        async move {
            let raw = self.into_sub_orchestration().await?;
            Json::decode::<T>(&raw)
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();
        match this.resolve(&mut inner) {
            Some((_, timestamp_ms, output)) => {
                inner.deliver(timestamp_ms);
                Poll::Ready(output)
            }
            None => Poll::Pending,
        }
    }
}

fn claim(kind: &Kind, inner: &mut CtxInner) -> Option<Claim> {
    // after the first divergence nothing else is claimed or scheduled
    if inner.nondeterminism.is_some() {
        return None;
    }

    let event_id = match inner.next_scheduled_event().cloned() {
        Some(recorded) => {
            if let Err(msg) = kind.check_replay(&recorded.kind) {
                inner.nondeterminism = Some(msg);
                return None;
            }
            inner.next_schedule += 1;
            recorded.event_id
        }
        None => record_new(kind, inner),
    };

    let external_ordinal = match kind {
        Kind::External { name } => Some(inner.next_external_ordinal(name)),
        _ => None,
    };
    Some(Claim {
        event_id,
        external_ordinal,
    })
}

fn record_new(kind: &Kind, inner: &mut CtxInner) -> u64 {
    let event_id = inner.allocate_event_id();
    let now = inner.logical_time_ms;

    let (event_kind, command) = match kind.clone() {
        Kind::Activity {
            name,
            input,
            retry_policy,
        } => (
            EventKind::TaskScheduled {
                name: name.clone(),
                input: input.clone(),
                retry_policy: retry_policy.clone(),
            },
            Some(Command::ScheduleActivity {
                task_id: event_id,
                name,
                input,
                retry_policy,
            }),
        ),
        Kind::Timer { delay_ms } => {
            let fire_at_ms = now.saturating_add(delay_ms);
            (
                EventKind::TimerCreated { fire_at_ms },
                Some(Command::ScheduleTimer {
                    timer_id: event_id,
                    fire_at_ms,
                }),
            )
        }
        Kind::External { name } => (
            EventKind::EventSubscribed { name: name.clone() },
            Some(Command::WaitForExternalEvent { id: event_id, name }),
        ),
        Kind::SubOrch {
            workflow_type,
            version,
            instance,
            input,
        } => {
            let instance = instance.unwrap_or_else(|| format!("{}::sub::{}", inner.meta.instance_id, event_id));
            (
                EventKind::SubOrchestrationScheduled {
                    workflow_type: workflow_type.clone(),
                    instance: instance.clone(),
                    input: input.clone(),
                },
                Some(Command::ScheduleSubOrchestration {
                    id: event_id,
                    workflow_type,
                    version,
                    instance,
                    input,
                }),
            )
        }
        Kind::System { op } => {
            let value = match op.as_str() {
                crate::SYSCALL_OP_GUID => uuid::Uuid::new_v4().to_string(),
                crate::SYSCALL_OP_UTCNOW_MS => crate::now_ms().to_string(),
                _ => String::new(),
            };
            (EventKind::SystemCall { op, value }, None)
        }
    };

    inner.push_new_event(Event::new(event_id, None, now, event_kind));
    if let Some(command) = command {
        inner.commands.push(command);
    }
    event_id
}

fn peek(kind: &Kind, claim: &Claim, inner: &CtxInner) -> Option<Resolved> {
    match kind {
        Kind::System { .. } => match &inner.event_by_id(claim.event_id)?.kind {
            // recorded values do not move logical time
            EventKind::SystemCall { value, .. } => Some((claim.event_id, 0, DurableOutput::System(value.clone()))),
            _ => None,
        },
        Kind::External { name } => {
            let raised = inner.raised_event(name, claim.external_ordinal?)?;
            match &raised.kind {
                EventKind::EventRaised { data, .. } => {
                    Some((raised.event_id, raised.timestamp_ms, DurableOutput::External(data.clone())))
                }
                _ => None,
            }
        }
        _ => {
            let done = inner.completion_for(claim.event_id)?;
            let output = match &done.kind {
                EventKind::TaskCompleted { result } => DurableOutput::Activity(Ok(result.clone())),
                EventKind::TaskFailed { details, .. } => DurableOutput::Activity(Err(details.display_message())),
                EventKind::TimerFired { .. } => DurableOutput::Timer,
                EventKind::SubOrchestrationCompleted { result } => DurableOutput::SubOrchestration(Ok(result.clone())),
                EventKind::SubOrchestrationFailed { details } => {
                    DurableOutput::SubOrchestration(Err(details.display_message()))
                }
                _ => return None,
            };
            Some((done.event_id, done.timestamp_ms, output))
        }
    }
}

/// Resolves when every child has completed. Results are in the order the
/// children were passed in.
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();

        let mut outputs = Vec::with_capacity(this.children.len());
        let mut latest = 0;
        let mut all_done = true;
        // every child is claimed on the first poll, even after one is found pending
        for child in this.children.iter_mut() {
            match child.resolve(&mut inner) {
                Some((_, ts, output)) => {
                    latest = latest.max(ts);
                    outputs.push(output);
                }
                None => all_done = false,
            }
        }

        if all_done {
            inner.deliver(latest);
            Poll::Ready(outputs)
        } else {
            Poll::Pending
        }
    }
}

/// Resolves with `(index, output)` of the child whose completion appears
/// first in history. With no children it never resolves.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let mut inner = ctx.lock();

        let mut winner: Option<(usize, u64, u64, DurableOutput)> = None;
        for (index, child) in this.children.iter_mut().enumerate() {
            if let Some((event_id, ts, output)) = child.resolve(&mut inner)
                && winner.as_ref().is_none_or(|(_, best, _, _)| event_id < *best)
            {
                winner = Some((index, event_id, ts, output));
            }
        }

        match winner {
            Some((index, _, ts, output)) => {
                inner.deliver(ts);
                Poll::Ready((index, output))
            }
            None => Poll::Pending,
        }
    }
}
