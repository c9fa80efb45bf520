//! Cancellation behavior of child workflows under each cancellation type,
//! live and replayed

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::*;
use everruns_replay::prelude::*;
use everruns_replay::{EventKind, OperationState};

fn parent(cancellation_type: CancellationType) -> Harness {
    let input = serde_json::to_value(ParentInput { cancellation_type })
        .expect("should serialize parent input");
    Harness::new(registry(), "parent", input)
}

/// Run the parent until its child is started, then cancel the run
fn start_and_cancel(cancellation_type: CancellationType) -> (Harness, Vec<Command>) {
    let mut harness = parent(cancellation_type);

    let first = harness.step().expect("should run first work unit");
    assert!(matches!(
        first.as_slice(),
        [Command::StartChildWorkflow { operation_id: OperationId(1), .. }]
    ));

    let none = harness
        .deliver(child_started(1))
        .expect("should accept child start");
    assert!(none.is_empty());

    let commands = harness
        .deliver(cancel_requested("operator"))
        .expect("should accept cancellation");
    (harness, commands)
}

fn cancel_child_command() -> Command {
    Command::RequestCancelExternalWorkflow {
        operation_id: OperationId(2),
        workflow_id: "child-1".to_string(),
        child_operation: Some(OperationId(1)),
    }
}

fn count_kind(history: &[HistoryEvent], kind: EventKind) -> usize {
    history.iter().filter(|e| e.kind() == kind).count()
}

#[test]
fn test_abandon_sends_no_cancel_request() {
    let (harness, commands) = start_and_cancel(CancellationType::Abandon);

    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0], Command::CancelWorkflow { .. }));
    assert_eq!(
        harness.engine.operation_state(OperationId(1)),
        Some(OperationState::Abandoned)
    );
    assert_eq!(
        count_kind(
            &harness.history,
            EventKind::RequestCancelExternalWorkflowExecutionInitiated
        ),
        0
    );
}

#[test]
fn test_try_cancel_unblocks_without_acknowledgment() {
    let (harness, commands) = start_and_cancel(CancellationType::TryCancel);

    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0], cancel_child_command());
    assert!(matches!(commands[1], Command::CancelWorkflow { .. }));
    assert_eq!(
        count_kind(
            &harness.history,
            EventKind::ExternalWorkflowExecutionCancelRequested
        ),
        0
    );
}

#[test]
fn test_wait_requested_unblocks_on_acknowledgment() {
    let (mut harness, commands) = start_and_cancel(CancellationType::WaitCancellationRequested);
    assert_eq!(commands, vec![cancel_child_command()]);

    let commands = harness
        .deliver(cancel_delivered(2))
        .expect("should accept acknowledgment");
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0], Command::CancelWorkflow { .. }));
    assert_eq!(
        count_kind(&harness.history, EventKind::ChildWorkflowExecutionCanceled),
        0
    );
}

#[test]
fn test_wait_completed_waits_for_child_terminal_event() {
    let (mut harness, commands) = start_and_cancel(CancellationType::WaitCancellationCompleted);
    assert_eq!(commands, vec![cancel_child_command()]);

    let commands = harness
        .deliver(cancel_delivered(2))
        .expect("should accept acknowledgment");
    assert!(commands.is_empty());
    assert_eq!(
        harness.engine.operation_state(OperationId(1)),
        Some(OperationState::AwaitingCancelConfirmation)
    );

    let commands = harness
        .deliver(child_canceled(1))
        .expect("should accept child cancellation");
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0], Command::CancelWorkflow { .. }));
}

#[test]
fn test_wait_completed_child_finishing_anyway() {
    let (mut harness, _) = start_and_cancel(CancellationType::WaitCancellationCompleted);
    harness
        .deliver(cancel_delivered(2))
        .expect("should accept acknowledgment");

    // The child ignored the request and completed; the parent sees its result
    let commands = harness
        .deliver(child_completed(1, json!("done")))
        .expect("should accept child completion");
    assert_eq!(
        commands,
        vec![Command::CompleteWorkflow {
            result: json!("done")
        }]
    );
}

#[test]
fn test_finished_cancellations_leave_no_operations_behind() {
    let (mut harness, _) = start_and_cancel(CancellationType::WaitCancellationCompleted);
    harness
        .deliver(cancel_delivered(2))
        .expect("should accept acknowledgment");
    assert_eq!(harness.engine.operation_state(OperationId(2)), None);

    harness
        .deliver(child_canceled(1))
        .expect("should accept child cancellation");
    assert_eq!(harness.engine.operation_state(OperationId(1)), None);
    assert!(harness.engine.snapshot().operations.is_empty());
}

#[test]
fn test_every_policy_replays_its_history() {
    for cancellation_type in [
        CancellationType::Abandon,
        CancellationType::TryCancel,
        CancellationType::WaitCancellationRequested,
        CancellationType::WaitCancellationCompleted,
    ] {
        let (mut harness, _) = start_and_cancel(cancellation_type);
        match cancellation_type {
            CancellationType::WaitCancellationRequested => {
                harness.deliver(cancel_delivered(2)).expect("should ack");
            }
            CancellationType::WaitCancellationCompleted => {
                harness.deliver(cancel_delivered(2)).expect("should ack");
                harness.deliver(child_canceled(1)).expect("should cancel");
            }
            _ => {}
        }

        let first = harness.replay().expect("should replay history");
        let second = harness.replay().expect("should replay history again");
        assert!(first.commands.is_empty(), "{:?}", cancellation_type);
        assert!(first.snapshot.closed, "{:?}", cancellation_type);
        assert_eq!(first, second);
        assert_eq!(
            count_kind(&harness.history, EventKind::WorkflowExecutionCanceled),
            1
        );
    }
}

#[test]
fn test_replay_before_acknowledgment_resumes_waiting() {
    let (harness, _) = start_and_cancel(CancellationType::WaitCancellationRequested);

    let outcome = harness.replay().expect("should replay history");
    assert!(outcome.commands.is_empty());
    assert!(!outcome.snapshot.closed);

    let child = outcome
        .snapshot
        .operations
        .iter()
        .find(|op| op.id == OperationId(1))
        .expect("should track child operation");
    assert_eq!(child.state, OperationState::AwaitingCancelConfirmation);
}

// =============================================================================
// Scopes
// =============================================================================

/// Sleeps; when cancelled, runs a cleanup activity in a detached scope
struct CleanupWorkflow {
    timer: Option<OperationId>,
    cleanup: Option<OperationId>,
    cancelled: Option<WorkflowError>,
}

impl Workflow for CleanupWorkflow {
    const TYPE: &'static str = "cleanup";
    type Input = Value;

    fn new(_input: Value) -> Self {
        Self {
            timer: None,
            cleanup: None,
            cancelled: None,
        }
    }
}

impl Fiber for CleanupWorkflow {
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError> {
        if self.timer.is_none() {
            let id = ctx.start_timer(Duration::from_secs(60))?;
            self.timer = Some(id);
            return Ok(FiberStep::await_operation(id));
        }

        if self.cleanup.is_none() {
            let error = match wakeup.into_result() {
                Ok(_) => return Ok(FiberStep::Complete(json!("slept"))),
                Err(error) => error,
            };
            ctx.open_scope(true)?;
            let id = ctx.schedule_activity("release", json!({}), ActivityOptions::default())?;
            self.cleanup = Some(id);
            self.cancelled = Some(error);
            return Ok(FiberStep::await_operation(id));
        }

        ctx.close_scope()?;
        let error = self
            .cancelled
            .take()
            .unwrap_or_else(|| WorkflowError::new("cleanup resumed twice"));
        Ok(FiberStep::Fail(error))
    }
}

/// Cancels its own scope before the timer command is ever sent
struct RetractWorkflow {
    timer: Option<OperationId>,
}

impl Workflow for RetractWorkflow {
    const TYPE: &'static str = "retract";
    type Input = Value;

    fn new(_input: Value) -> Self {
        Self { timer: None }
    }
}

impl Fiber for RetractWorkflow {
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError> {
        if self.timer.is_none() {
            let scope = ctx.open_scope(false)?;
            let id = ctx.start_timer(Duration::from_secs(5))?;
            ctx.cancel_scope(scope)?;
            self.timer = Some(id);
            return Ok(FiberStep::await_operation(id));
        }

        ctx.close_scope()?;
        match wakeup.resolution() {
            Some(resolution) if resolution.is_cancelled() => {
                Ok(FiberStep::Complete(json!("retracted")))
            }
            _ => Ok(FiberStep::Complete(json!("fired"))),
        }
    }
}

/// Hands a timer-waiting worker to a scope owner that returns immediately,
/// then sleeps on a timer of its own
struct HandoffWorkflow {
    timer: Option<OperationId>,
}

impl Workflow for HandoffWorkflow {
    const TYPE: &'static str = "handoff";
    type Input = Value;

    fn new(_input: Value) -> Self {
        Self { timer: None }
    }
}

impl Fiber for HandoffWorkflow {
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError> {
        if self.timer.is_none() {
            ctx.spawn_scoped(
                false,
                fiber_fn(|ctx, _| {
                    let mut timer: Option<OperationId> = None;
                    ctx.spawn(fiber_fn(move |ctx, wakeup| match timer {
                        None => {
                            let id = ctx.start_timer(Duration::from_secs(60))?;
                            timer = Some(id);
                            Ok(FiberStep::await_operation(id))
                        }
                        Some(_) => Ok(FiberStep::from_result(wakeup.into_result())),
                    }))?;
                    Ok(FiberStep::Complete(json!("handed off")))
                }),
            )?;
            let id = ctx.start_timer(Duration::from_secs(30))?;
            self.timer = Some(id);
            return Ok(FiberStep::await_operation(id));
        }
        Ok(FiberStep::from_result(wakeup.into_result()))
    }
}

/// Schedules one activity and returns its result
struct ChargeWorkflow {
    activity: Option<OperationId>,
}

impl Workflow for ChargeWorkflow {
    const TYPE: &'static str = "charge";
    type Input = Value;

    fn new(_input: Value) -> Self {
        Self { activity: None }
    }
}

impl Fiber for ChargeWorkflow {
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError> {
        if self.activity.is_none() {
            let id = ctx.schedule_activity("charge", json!({}), ActivityOptions::default())?;
            self.activity = Some(id);
            return Ok(FiberStep::await_operation(id));
        }
        Ok(FiberStep::from_result(wakeup.into_result()))
    }
}

fn scope_registry() -> std::sync::Arc<WorkflowRegistry> {
    let mut registry = WorkflowRegistry::new();
    registry.register::<CleanupWorkflow>();
    registry.register::<RetractWorkflow>();
    registry.register::<HandoffWorkflow>();
    registry.register::<ChargeWorkflow>();
    std::sync::Arc::new(registry)
}

#[test]
fn test_detached_scope_runs_cleanup_after_cancel() {
    let mut harness = Harness::new(scope_registry(), "cleanup", json!(null));
    let first = harness.step().expect("should start timer");
    assert!(matches!(first.as_slice(), [Command::StartTimer { .. }]));

    let commands = harness
        .deliver(cancel_requested("shutdown"))
        .expect("should accept cancellation");
    assert_eq!(commands.len(), 2);
    assert_eq!(
        commands[0],
        Command::CancelTimer {
            operation_id: OperationId(1)
        }
    );
    match &commands[1] {
        Command::ScheduleActivity {
            operation_id,
            activity_type,
            ..
        } => {
            assert_eq!(*operation_id, OperationId(2));
            assert_eq!(activity_type, "release");
        }
        other => panic!("expected cleanup activity, got {:?}", other),
    }
    assert_eq!(
        harness.engine.operation_state(OperationId(2)),
        Some(OperationState::Initiated)
    );

    let commands = harness
        .deliver(activity_completed(2, json!(true)))
        .expect("should finish cleanup");
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0], Command::CancelWorkflow { .. }));

    let outcome = harness.replay().expect("should replay cleanup history");
    assert!(outcome.snapshot.closed);
}

#[test]
fn test_cancel_before_send_retracts_command() {
    let mut harness = Harness::new(scope_registry(), "retract", json!(null));

    let commands = harness.step().expect("should run first work unit");
    assert_eq!(
        commands,
        vec![Command::CompleteWorkflow {
            result: json!("retracted")
        }]
    );

    let outcome = harness.replay().expect("should replay retracted history");
    assert!(outcome.commands.is_empty());
    assert!(outcome.snapshot.closed);
}

#[test]
fn test_cancel_reaches_fibers_of_finished_scope_owner() {
    let mut harness = Harness::new(scope_registry(), "handoff", json!(null));

    let commands = harness.step().expect("should start both timers");
    assert_eq!(
        commands,
        vec![
            Command::StartTimer {
                operation_id: OperationId(1),
                duration: Duration::from_secs(30),
            },
            Command::StartTimer {
                operation_id: OperationId(2),
                duration: Duration::from_secs(60),
            },
        ]
    );

    let commands = harness
        .deliver(cancel_requested("shutdown"))
        .expect("should accept cancellation");
    assert_eq!(commands.len(), 3);
    assert_eq!(
        commands[0],
        Command::CancelTimer {
            operation_id: OperationId(1)
        }
    );
    assert_eq!(
        commands[1],
        Command::CancelTimer {
            operation_id: OperationId(2)
        }
    );
    assert!(matches!(commands[2], Command::CancelWorkflow { .. }));

    let outcome = harness.replay().expect("should replay handoff history");
    assert!(outcome.snapshot.closed);
}

#[test]
fn test_activity_completing_alongside_cancel_request() {
    let mut harness = Harness::new(scope_registry(), "charge", json!(null));
    let first = harness.step().expect("should schedule activity");
    assert!(matches!(
        first.as_slice(),
        [Command::ScheduleActivity { operation_id: OperationId(1), .. }]
    ));
    assert!(harness.step().expect("should accept echoes").is_empty());

    // Both arrive before the engine sees either
    harness.record(cancel_requested("operator"));
    harness.record(activity_completed(1, json!("charged")));
    let commands = harness.step().expect("should accept both events");
    assert_eq!(
        commands,
        vec![
            Command::RequestCancelActivity {
                operation_id: OperationId(1)
            },
            Command::CompleteWorkflow {
                result: json!("charged")
            },
        ]
    );

    let rest = harness
        .step()
        .expect("cancel request echo after completion should be accepted");
    assert!(rest.is_empty());
    assert!(harness.engine.is_finished());
    assert_eq!(
        count_kind(&harness.history, EventKind::ActivityTaskCancelRequested),
        1
    );

    let outcome = harness.replay().expect("should replay the race");
    assert!(outcome.commands.is_empty());
    assert!(outcome.snapshot.closed);
}
