use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use duroflow::{ActivityContext, ActivityRegistry, DurableOutput, EventKind, InstanceStatus, OrchestrationContext, OrchestrationRegistry};

mod common;
use common::{Harness, fast_options};

#[tokio::test]
async fn sample_hello_world() {
    let activities = ActivityRegistry::builder()
        .register("Hello", |_ctx: ActivityContext, input: String| async move { Ok(format!("Hello, {input}!")) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("HelloWorld", |ctx: OrchestrationContext, input: String| async move {
            ctx.trace_info("hello_world started");
            let res = ctx.call_activity("Hello", input).into_activity().await?;
            ctx.trace_info(format!("hello_world result={res}"));
            Ok(res)
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    let info = h.run("HelloWorld", "inst-hello-1", "Rust").await;
    assert_eq!(info.status, InstanceStatus::Completed);
    assert_eq!(info.output.as_deref(), Some("Hello, Rust!"));
    assert_eq!(info.version, "1.0.0");

    let hist = h.client.read_history("inst-hello-1", 1).await.unwrap();
    assert_eq!(
        common::kinds(&hist),
        vec!["OrchestratorStarted", "TaskScheduled", "TaskCompleted", "ExecutionCompleted"]
    );
    assert!(hist.windows(2).all(|w| w[0].event_id < w[1].event_id));
    h.shutdown().await;
}

#[tokio::test]
async fn sample_sequential_loop() {
    let activities = ActivityRegistry::builder()
        .register("Append", |_ctx: ActivityContext, input: String| async move { Ok(format!("{input}x")) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Loop", |ctx: OrchestrationContext, input: String| async move {
            let mut acc = input;
            for _ in 0..3 {
                acc = ctx.call_activity("Append", acc).into_activity().await?;
            }
            Ok(acc)
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    let info = h.run("Loop", "inst-loop-1", "start").await;
    assert_eq!(info.output.as_deref(), Some("startxxx"));
    h.shutdown().await;
}

#[tokio::test]
async fn fan_out_fan_in_with_one_failure() {
    let activities = ActivityRegistry::builder()
        .register("Process", |_ctx: ActivityContext, input: String| async move {
            if input == "3" {
                Err(format!("item {input} rejected"))
            } else {
                Ok(format!("processed-{input}"))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("FanOut", |ctx: OrchestrationContext, _input: String| async move {
            let tasks = (1..=5).map(|i| ctx.call_activity("Process", i.to_string())).collect();
            let results = ctx.when_all(tasks).await;
            let mut successful = 0;
            let mut failed = 0;
            let mut order = Vec::new();
            for r in results {
                match r {
                    DurableOutput::Activity(Ok(v)) => {
                        successful += 1;
                        order.push(v);
                    }
                    DurableOutput::Activity(Err(_)) => failed += 1,
                    other => return Err(format!("unexpected output {other:?}")),
                }
            }
            Ok(format!("successful={successful}, failed={failed}; {}", order.join(",")))
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    let info = h.run("FanOut", "inst-fanout-1", "").await;
    assert_eq!(info.status, InstanceStatus::Completed);
    assert_eq!(
        info.output.as_deref(),
        Some("successful=4, failed=1; processed-1,processed-2,processed-4,processed-5")
    );

    let hist = h.client.read_history("inst-fanout-1", 1).await.unwrap();
    let scheduled = hist
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskScheduled { .. }))
        .count();
    assert_eq!(scheduled, 5);
    h.shutdown().await;
}

#[tokio::test]
async fn race_activity_beats_long_timer() {
    let activities = ActivityRegistry::builder()
        .register("Fast", |_ctx: ActivityContext, _input: String| async move { Ok("fast".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Race", |ctx: OrchestrationContext, _input: String| async move {
            let timer = ctx.create_timer(Duration::from_secs(30));
            let work = ctx.call_activity("Fast", "");
            match ctx.when_any(vec![timer, work]).await {
                (1, DurableOutput::Activity(Ok(v))) => Ok(v),
                (idx, other) => Err(format!("unexpected winner {idx}: {other:?}")),
            }
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    let info = h.run("Race", "inst-race-1", "").await;
    assert_eq!(info.output.as_deref(), Some("fast"));
    h.shutdown().await;
}

#[tokio::test]
async fn race_timer_beats_slow_activity() {
    let activities = ActivityRegistry::builder()
        .register("Slow", |_ctx: ActivityContext, _input: String| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok("slow".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Race", |ctx: OrchestrationContext, _input: String| async move {
            let timer = ctx.create_timer(Duration::from_millis(20));
            let work = ctx.call_activity("Slow", "");
            let (idx, _) = ctx.when_any(vec![timer, work]).await;
            Ok(if idx == 0 { "timeout" } else { "work" }.to_string())
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    let info = h.run("Race", "inst-race-2", "").await;
    assert_eq!(info.output.as_deref(), Some("timeout"));

    let hist = h.client.read_history("inst-race-2", 1).await.unwrap();
    let created = hist.iter().find_map(|e| match e.kind {
        EventKind::TimerCreated { fire_at_ms } => Some(fire_at_ms),
        _ => None,
    });
    let fired = hist.iter().find(|e| matches!(e.kind, EventKind::TimerFired { .. }));
    assert!(fired.is_some_and(|f| f.timestamp_ms >= created.unwrap_or(u64::MAX)));
    h.shutdown().await;
}

#[tokio::test]
async fn external_event_raised_before_subscription_is_buffered() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let activity_gate = gate.clone();
    let activities = ActivityRegistry::builder()
        .register("Gate", move |_ctx: ActivityContext, _input: String| {
            let gate = activity_gate.clone();
            async move {
                gate.notified().await;
                Ok("opened".to_string())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Approval", |ctx: OrchestrationContext, _input: String| async move {
            ctx.call_activity("Gate", "").into_activity().await?;
            ctx.wait_for_external_event("Approved").into_event().await
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    h.client
        .start_workflow("Approval", Some("inst-ext-1"), "")
        .await
        .unwrap();
    assert!(
        common::wait_for_history(
            &h.client,
            "inst-ext-1",
            1,
            |hist| hist.iter().any(|e| matches!(e.kind, EventKind::TaskScheduled { .. })),
            5_000
        )
        .await
    );

    h.client
        .raise_event("inst-ext-1", "Approved", "yes")
        .await
        .unwrap();
    assert!(
        common::wait_for_history(
            &h.client,
            "inst-ext-1",
            1,
            |hist| hist.iter().any(|e| matches!(e.kind, EventKind::EventRaised { .. })),
            5_000
        )
        .await
    );
    gate.notify_one();

    let info = h
        .client
        .wait_for_completion("inst-ext-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.output.as_deref(), Some("yes"));

    let hist = h.client.read_history("inst-ext-1", 1).await.unwrap();
    let raised = hist
        .iter()
        .position(|e| matches!(e.kind, EventKind::EventRaised { .. }));
    let subscribed = hist
        .iter()
        .position(|e| matches!(e.kind, EventKind::EventSubscribed { .. }));
    assert!(raised < subscribed);
    h.shutdown().await;
}

#[tokio::test]
async fn child_workflow_result_and_failure_reach_parent() {
    let activities = ActivityRegistry::builder().build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Child", |_ctx: OrchestrationContext, input: String| async move {
            if input == "bad" {
                Err("child rejected input".to_string())
            } else {
                Ok(format!("child({input})"))
            }
        })
        .register("Parent", |ctx: OrchestrationContext, input: String| async move {
            let ok = ctx.call_child_workflow("Child", input).into_sub_orchestration().await?;
            let err = ctx
                .call_child_workflow("Child", "bad")
                .into_sub_orchestration()
                .await
                .unwrap_err();
            Ok(format!("{ok} | {err}"))
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    let info = h.run("Parent", "inst-parent-1", "a").await;
    assert_eq!(info.status, InstanceStatus::Completed);
    let output = info.output.unwrap();
    assert!(output.starts_with("child(a) | "));
    assert!(output.contains("child rejected input"));

    let child = h.client.get_status("inst-parent-1::sub::2").await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    assert_eq!(child.parent_instance_id.as_deref(), Some("inst-parent-1"));
    h.shutdown().await;
}

#[tokio::test]
async fn system_calls_are_recorded_once() {
    let activities = ActivityRegistry::builder()
        .register("Noop", |_ctx: ActivityContext, _input: String| async move { Ok(String::new()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Guids", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.new_guid().await;
            let now = ctx.utc_now_ms().await;
            // force a replay of the system calls on the next turn
            ctx.call_activity("Noop", "").into_activity().await?;
            let b = ctx.new_guid().await;
            Ok(format!("{a}|{b}|{}", now > 0))
        })
        .build();

    let h = Harness::start(activities, orchestrations).await;
    let info = h.run("Guids", "inst-guid-1", "").await;
    let output = info.output.unwrap();
    let parts: Vec<&str> = output.split('|').collect();
    assert_eq!(parts.len(), 3);
    assert_ne!(parts[0], parts[1]);
    assert_eq!(parts[2], "true");

    let hist = h.client.read_history("inst-guid-1", 1).await.unwrap();
    let first_guid = hist.iter().find_map(|e| match &e.kind {
        EventKind::SystemCall { op, value } if op == "guid" => Some(value.clone()),
        _ => None,
    });
    assert_eq!(first_guid.as_deref(), Some(parts[0]));
    h.shutdown().await;
}

#[tokio::test]
async fn fan_out_under_concurrent_dispatch_runs_each_activity_once() {
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();
    let activities = ActivityRegistry::builder()
        .register("Count", move |_ctx: ActivityContext, input: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Wide", |ctx: OrchestrationContext, _input: String| async move {
            let tasks = (0..50).map(|i| ctx.call_activity("Count", i.to_string())).collect();
            let results = ctx.when_all(tasks).await;
            Ok(results.len().to_string())
        })
        .build();

    // completions pile up on one instance and keep finding it busy
    let mut options = fast_options();
    options.orchestration_concurrency = 4;
    options.busy_instance_retry_delay = Duration::from_millis(1);
    let h = Harness::start_with_options(activities, orchestrations, options).await;
    let info = h.run("Wide", "inst-wide-1", "").await;
    assert_eq!(info.output.as_deref(), Some("50"));
    assert_eq!(executions.load(Ordering::SeqCst), 50);

    let hist = h.client.read_history("inst-wide-1", 1).await.unwrap();
    let completed = hist
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 50);
    h.shutdown().await;
}

fn approval_gate(timeout: Duration) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("ApprovalGate", move |ctx: OrchestrationContext, _input: String| async move {
            let approval = ctx.wait_for_external_event("order-approved");
            let deadline = ctx.create_timer(timeout);
            match ctx.when_any(vec![approval, deadline]).await {
                (0, DurableOutput::External(data)) => Ok(format!("approved:{data}")),
                (1, DurableOutput::Timer) => {
                    let escalated = ctx.call_activity("Escalate", "").into_activity().await?;
                    Ok(format!("timed out:{escalated}"))
                }
                (idx, other) => Err(format!("unexpected winner {idx}: {other:?}")),
            }
        })
        .build()
}

#[tokio::test]
async fn approval_arrives_before_deadline() {
    let activities = ActivityRegistry::builder()
        .register("Escalate", |_ctx: ActivityContext, _input: String| async move { Ok("manager".to_string()) })
        .build();
    let h = Harness::start(activities, approval_gate(Duration::from_secs(48 * 3600))).await;
    h.client
        .start_workflow("ApprovalGate", Some("inst-gate-1"), "")
        .await
        .unwrap();
    assert!(common::wait_for_subscription(&h.client, "inst-gate-1", "order-approved", 5_000).await);
    h.client
        .raise_event("inst-gate-1", "order-approved", "alice")
        .await
        .unwrap();

    let info = h
        .client
        .wait_for_completion("inst-gate-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.output.as_deref(), Some("approved:alice"));

    let hist = h.client.read_history("inst-gate-1", 1).await.unwrap();
    assert!(!hist.iter().any(|e| matches!(e.kind, EventKind::TimerFired { .. })));
    assert!(!hist.iter().any(|e| matches!(e.kind, EventKind::TaskScheduled { .. })));
    h.shutdown().await;
}

#[tokio::test]
async fn deadline_wins_and_late_approval_is_ignored() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let activity_gate = gate.clone();
    let activities = ActivityRegistry::builder()
        .register("Escalate", move |_ctx: ActivityContext, _input: String| {
            let gate = activity_gate.clone();
            async move {
                gate.notified().await;
                Ok("manager".to_string())
            }
        })
        .build();
    let h = Harness::start(activities, approval_gate(Duration::from_millis(30))).await;
    h.client
        .start_workflow("ApprovalGate", Some("inst-gate-2"), "")
        .await
        .unwrap();
    assert!(
        common::wait_for_history(
            &h.client,
            "inst-gate-2",
            1,
            |hist| hist.iter().any(|e| matches!(e.kind, EventKind::TaskScheduled { .. })),
            5_000
        )
        .await
    );

    // the race is already decided; the approval is recorded but never read
    h.client
        .raise_event("inst-gate-2", "order-approved", "bob")
        .await
        .unwrap();
    assert!(
        common::wait_for_history(
            &h.client,
            "inst-gate-2",
            1,
            |hist| hist.iter().any(|e| matches!(e.kind, EventKind::EventRaised { .. })),
            5_000
        )
        .await
    );
    gate.notify_one();

    let info = h
        .client
        .wait_for_completion("inst-gate-2", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, InstanceStatus::Completed);
    assert_eq!(info.output.as_deref(), Some("timed out:manager"));
    h.shutdown().await;
}
