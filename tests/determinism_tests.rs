//! Replay determinism and fan-in properties, driven through `run_turn`
//! without a runtime.

use duroflow::{Command, DurableOutput, Event, EventKind, OrchestrationContext, TurnMeta, run_turn};
use proptest::prelude::*;

fn started(input: &str) -> Event {
    Event::new(
        1,
        None,
        1_000,
        EventKind::OrchestratorStarted {
            workflow_type: "Fan".into(),
            version: "1.0.0".into(),
            input: input.into(),
            parent_instance: None,
            parent_id: None,
        },
    )
}

async fn fan(ctx: OrchestrationContext, width: usize) -> Result<String, String> {
    let tasks = (0..width).map(|i| ctx.call_activity("Work", i.to_string())).collect();
    let results = ctx.when_all(tasks).await;
    let parts: Vec<String> = results
        .into_iter()
        .map(|r| match r {
            DurableOutput::Activity(Ok(v)) => v,
            other => format!("{other:?}"),
        })
        .collect();
    Ok(parts.join(","))
}

/// History after the first turn of `fan(width)` plus completions delivered in
/// `completion_order`.
fn fan_history(width: usize, completion_order: &[usize]) -> Vec<Event> {
    let first = run_turn(vec![started("")], TurnMeta::default(), |ctx| fan(ctx, width));
    let mut history = first.history;
    let mut next_id = history.last().map(|e| e.event_id + 1).unwrap_or(1);
    for &i in completion_order {
        let task_id = 2 + i as u64;
        history.push(Event::new(
            next_id,
            Some(task_id),
            2_000 + next_id,
            EventKind::TaskCompleted { result: format!("r{i}") },
        ));
        next_id += 1;
    }
    history
}

#[test]
fn schedule_mismatch_is_nondeterminism() {
    let history = vec![
        started(""),
        Event::new(
            2,
            None,
            1_000,
            EventKind::TaskScheduled {
                name: "A".into(),
                input: String::new(),
                retry_policy: None,
            },
        ),
    ];
    let turn = run_turn(history, TurnMeta::default(), |ctx| async move {
        ctx.call_activity("B", "").into_activity().await
    });
    assert!(turn.output.is_none());
    let err = turn.nondeterminism.unwrap();
    assert!(err.contains("TaskScheduled"), "{err}");
}

#[test]
fn finishing_with_unreached_schedules_is_nondeterminism() {
    let history = vec![
        started(""),
        Event::new(2, None, 1_000, EventKind::TimerCreated { fire_at_ms: 5_000 }),
    ];
    let turn = run_turn(history, TurnMeta::default(), |_ctx| async move { Ok::<_, String>("done".to_string()) });
    assert!(turn.nondeterminism.is_some());
}

#[test]
fn when_all_waits_for_every_child() {
    let history = fan_history(4, &[3, 0, 2]);
    let turn = run_turn(history, TurnMeta::default(), |ctx| fan(ctx, 4));
    assert!(turn.output.is_none());
    assert!(turn.commands.is_empty());
    assert!(turn.new_events.is_empty());
}

#[test]
fn when_any_resolves_exactly_one() {
    let history = vec![
        started(""),
        Event::new(2, None, 1_000, EventKind::TimerCreated { fire_at_ms: 1_500 }),
        Event::new(
            3,
            None,
            1_000,
            EventKind::TaskScheduled {
                name: "Work".into(),
                input: String::new(),
                retry_policy: None,
            },
        ),
        Event::new(4, Some(3), 1_200, EventKind::TaskCompleted { result: "w".into() }),
        Event::new(5, Some(2), 1_500, EventKind::TimerFired { fire_at_ms: 1_500 }),
    ];
    let turn = run_turn(history, TurnMeta::default(), |ctx| async move {
        let timer = ctx.create_timer(std::time::Duration::from_millis(500));
        let work = ctx.call_activity("Work", "");
        let (idx, out) = ctx.when_any(vec![timer, work]).await;
        Ok::<_, String>(format!("{idx}:{out:?}"))
    });
    assert_eq!(turn.output, Some(Ok(r#"1:Activity(Ok("w"))"#.to_string())));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replaying the same history always yields the same commands and events.
    #[test]
    fn prop_replay_is_idempotent(width in 1usize..8, delivered in 0usize..8) {
        let order: Vec<usize> = (0..delivered.min(width)).collect();
        let history = fan_history(width, &order);

        let a = run_turn(history.clone(), TurnMeta::default(), |ctx| fan(ctx, width));
        let b = run_turn(history, TurnMeta::default(), |ctx| fan(ctx, width));
        prop_assert_eq!(&a.commands, &b.commands);
        prop_assert_eq!(&a.new_events, &b.new_events);
        prop_assert_eq!(&a.output, &b.output);
        prop_assert!(a.nondeterminism.is_none());
    }

    /// `when_all` results follow emission order regardless of completion order.
    #[test]
    fn prop_when_all_preserves_emission_order(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()) {
        let history = fan_history(6, &order);
        let turn = run_turn(history, TurnMeta::default(), |ctx| fan(ctx, 6));
        prop_assert_eq!(turn.output, Some(Ok("r0,r1,r2,r3,r4,r5".to_string())));
    }

    /// A replayed first turn schedules nothing new.
    #[test]
    fn prop_first_turn_commands_are_stable(width in 1usize..10) {
        let first = run_turn(vec![started("")], TurnMeta::default(), |ctx| fan(ctx, width));
        prop_assert_eq!(first.commands.len(), width);
        let all_schedule_activity = first.commands.iter().all(|c| matches!(c, Command::ScheduleActivity { .. }));
        prop_assert!(all_schedule_activity);

        let replay = run_turn(first.history.clone(), TurnMeta::default(), |ctx| fan(ctx, width));
        prop_assert!(replay.commands.is_empty());
        prop_assert!(replay.new_events.is_empty());
    }
}
