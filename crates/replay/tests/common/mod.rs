//! Shared fixtures for integration tests
//!
//! [`Harness`] plays the orchestration service synchronously: it keeps the
//! history, feeds the engine everything recorded since the last batch, and
//! records `WorkflowTaskCompleted` plus echoes whenever a live round ran.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use everruns_replay::engine::ReplayOutcome;
use everruns_replay::prelude::*;

/// Fixed clock so histories built twice are identical
pub fn timestamp(sequence_id: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + sequence_id as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn run_id() -> Uuid {
    Uuid::from_u128(0x5eed)
}

pub struct Harness {
    pub engine: ReplayEngine,
    pub history: Vec<HistoryEvent>,
    registry: Arc<WorkflowRegistry>,
    config: EngineConfig,
    delivered: usize,
}

impl Harness {
    pub fn new(registry: Arc<WorkflowRegistry>, workflow_type: &str, input: Value) -> Self {
        let config = EngineConfig::default();
        let mut harness = Self {
            engine: ReplayEngine::new(registry.clone(), config.clone()),
            history: Vec::new(),
            registry,
            config,
            delivered: 0,
        };
        harness.record(EventAttributes::WorkflowExecutionStarted {
            workflow_type: workflow_type.to_string(),
            workflow_id: "wf-1".to_string(),
            run_id: run_id(),
            input,
        });
        harness
    }

    /// Append an event without delivering it
    pub fn record(&mut self, attributes: EventAttributes) {
        let sequence_id = self.history.len() as u64 + 1;
        self.history
            .push(HistoryEvent::new(sequence_id, timestamp(sequence_id), attributes));
    }

    /// Deliver everything recorded since the last batch
    pub fn step(&mut self) -> Result<Vec<Command>, EngineError> {
        let batch = self.history[self.delivered..].to_vec();
        self.delivered = self.history.len();

        let rounds = self.engine.live_rounds();
        let commands = self.engine.advance(&batch)?;
        if self.engine.live_rounds() > rounds {
            self.record(EventAttributes::WorkflowTaskCompleted);
            for command in &commands {
                self.record(command.echo());
            }
        }
        Ok(commands)
    }

    /// Record one event and deliver it
    pub fn deliver(&mut self, attributes: EventAttributes) -> Result<Vec<Command>, EngineError> {
        self.record(attributes);
        self.step()
    }

    /// Replay the recorded history in a fresh engine
    pub fn replay(&self) -> Result<ReplayOutcome, EngineError> {
        replay_history(self.registry.clone(), &self.history, self.config.clone())
    }

    /// Replay the first `len` events in a fresh engine
    pub fn replay_prefix(&self, len: usize) -> Result<ReplayOutcome, EngineError> {
        replay_history(
            self.registry.clone(),
            &self.history[..len],
            self.config.clone(),
        )
    }
}

// =============================================================================
// Event shorthands
// =============================================================================

pub fn child_started(operation_id: u64) -> EventAttributes {
    EventAttributes::ChildWorkflowExecutionStarted {
        operation_id: OperationId(operation_id),
        run_id: Uuid::from_u128(0xc41d),
    }
}

pub fn child_completed(operation_id: u64, result: Value) -> EventAttributes {
    EventAttributes::ChildWorkflowExecutionCompleted {
        operation_id: OperationId(operation_id),
        result,
    }
}

pub fn child_canceled(operation_id: u64) -> EventAttributes {
    EventAttributes::ChildWorkflowExecutionCanceled {
        operation_id: OperationId(operation_id),
    }
}

pub fn cancel_delivered(operation_id: u64) -> EventAttributes {
    EventAttributes::ExternalWorkflowExecutionCancelRequested {
        operation_id: OperationId(operation_id),
    }
}

pub fn cancel_requested(reason: &str) -> EventAttributes {
    EventAttributes::WorkflowExecutionCancelRequested {
        reason: reason.to_string(),
    }
}

pub fn activity_completed(operation_id: u64, result: Value) -> EventAttributes {
    EventAttributes::ActivityTaskCompleted {
        operation_id: OperationId(operation_id),
        result,
    }
}

pub fn timer_fired(operation_id: u64) -> EventAttributes {
    EventAttributes::TimerFired {
        operation_id: OperationId(operation_id),
    }
}

// =============================================================================
// Workflows
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentInput {
    pub cancellation_type: CancellationType,
}

/// Starts one child workflow and returns its result
pub struct ParentWorkflow {
    input: ParentInput,
    child: Option<OperationId>,
}

impl Workflow for ParentWorkflow {
    const TYPE: &'static str = "parent";
    type Input = ParentInput;

    fn new(input: ParentInput) -> Self {
        Self { input, child: None }
    }
}

impl Fiber for ParentWorkflow {
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError> {
        if self.child.is_none() {
            let options = ChildWorkflowOptions::new("child-1")
                .with_cancellation_type(self.input.cancellation_type);
            let id = ctx.start_child_workflow("child", json!({}), options)?;
            self.child = Some(id);
            return Ok(FiberStep::await_operation(id));
        }
        Ok(FiberStep::from_result(wakeup.into_result()))
    }
}

/// Spawns `width` fibers that each sleep on their own timer, then joins
/// them in creation order
pub struct FanOutWorkflow {
    width: u64,
    fibers: Vec<FiberId>,
    results: Vec<Value>,
}

impl Workflow for FanOutWorkflow {
    const TYPE: &'static str = "fan_out";
    type Input = u64;

    fn new(width: u64) -> Self {
        Self {
            width,
            fibers: Vec::new(),
            results: Vec::new(),
        }
    }
}

impl Fiber for FanOutWorkflow {
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError> {
        if self.width == 0 {
            return Ok(FiberStep::Complete(json!([])));
        }
        if self.fibers.is_empty() {
            for index in 0..self.width {
                let mut timer: Option<OperationId> = None;
                let fiber = ctx.spawn(fiber_fn(move |ctx, wakeup| match timer {
                    None => {
                        let id = ctx.start_timer(Duration::from_secs(index + 1))?;
                        timer = Some(id);
                        Ok(FiberStep::await_operation(id))
                    }
                    Some(_) => {
                        wakeup.into_result().map_err(|e| {
                            EngineError::invalid_step(format!("timer failed: {}", e))
                        })?;
                        Ok(FiberStep::Complete(json!(index)))
                    }
                }))?;
                self.fibers.push(fiber);
            }
            return Ok(FiberStep::await_fiber(self.fibers[0]));
        }

        match wakeup.into_result() {
            Ok(value) => self.results.push(value),
            Err(error) => return Ok(FiberStep::Fail(error)),
        }
        match self.fibers.get(self.results.len()) {
            Some(next) => Ok(FiberStep::await_fiber(*next)),
            None => Ok(FiberStep::Complete(json!(self.results))),
        }
    }
}

pub fn registry() -> Arc<WorkflowRegistry> {
    let mut registry = WorkflowRegistry::new();
    registry.register::<ParentWorkflow>();
    registry.register::<FanOutWorkflow>();
    Arc::new(registry)
}
