//! Workflow context: the only door from fiber code to run state

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::{ActivityOptions, ChildWorkflowOptions, Fiber, FiberId};
use crate::command::Command;
use crate::engine::{EngineError, NonDeterminismError, RunCore, RunInfo};
use crate::operation::{
    ActivityOp, CancelRequestOp, ChildWorkflowOp, Operation, OperationId, OperationState, TimerOp,
};
use crate::scope::ScopeId;
use crate::versioning::{Marker, VersionDecision};

/// Handle passed to a fiber for the duration of one resume
///
/// Every call is recorded against the calling fiber and its innermost
/// scope, so replays that make the same calls in the same order produce
/// the same operation ids, commands, and markers.
pub struct WorkflowContext<'a> {
    core: &'a mut RunCore,
    fiber: FiberId,
}

impl<'a> WorkflowContext<'a> {
    pub(crate) fn new(core: &'a mut RunCore, fiber: FiberId) -> Self {
        Self { core, fiber }
    }

    pub fn run_info(&self) -> &RunInfo {
        &self.core.run
    }

    pub fn workflow_id(&self) -> &str {
        &self.core.run.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.core.run.run_id
    }

    /// The fiber being resumed
    pub fn fiber_id(&self) -> FiberId {
        self.fiber
    }

    /// Whether this resume is re-deriving decisions already in history
    pub fn is_replaying(&self) -> bool {
        self.core.replaying
    }

    /// Deterministic clock: the timestamp of the latest event applied
    pub fn now(&self) -> DateTime<Utc> {
        self.core.now
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// Innermost scope of the calling fiber
    pub fn current_scope(&self) -> ScopeId {
        self.core.current_scope(self.fiber)
    }

    /// Open a child scope and make it the fiber's innermost scope
    ///
    /// A detached scope ignores cancellation of its ancestors.
    pub fn open_scope(&mut self, detached: bool) -> Result<ScopeId, EngineError> {
        let parent = self.current_scope();
        let scope = self
            .core
            .scopes
            .open(parent, detached)
            .ok_or_else(|| EngineError::invalid_step(format!("{} no longer exists", parent)))?;

        let record = self.core.fiber_mut(self.fiber)?;
        record.scope_stack.push(scope);
        record.owned_scopes.push(scope);
        self.core.progress += 1;
        Ok(scope)
    }

    /// Close the innermost scope opened by this fiber
    ///
    /// Operations and fibers still attached to it move to the enclosing
    /// scope.
    pub fn close_scope(&mut self) -> Result<ScopeId, EngineError> {
        let fiber = self.fiber;
        let record = self.core.fiber_mut(fiber)?;
        if record.scope_stack.len() < 2 {
            return Err(EngineError::invalid_step(format!(
                "{} has no open scope to close",
                fiber
            )));
        }
        let scope = record.scope_stack.pop().unwrap_or(ScopeId::ROOT);
        record.owned_scopes.retain(|s| *s != scope);

        self.core.release_scope(scope);
        Ok(scope)
    }

    /// Request cancellation of a scope and everything beneath it
    pub fn cancel_scope(&mut self, scope: ScopeId) -> Result<(), EngineError> {
        if !self.core.scopes.contains(scope) {
            return Err(EngineError::invalid_step(format!(
                "{} cancelled unknown {}",
                self.fiber, scope
            )));
        }
        self.core.request_cancel(scope, "cancelled by workflow");
        Ok(())
    }

    pub fn is_cancel_requested(&self, scope: ScopeId) -> bool {
        self.core.scopes.is_cancel_requested(scope)
    }

    /// Whether the calling fiber's innermost scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.is_cancel_requested(self.current_scope())
    }

    // =========================================================================
    // Fibers
    // =========================================================================

    /// Spawn a fiber in the caller's innermost scope
    pub fn spawn(&mut self, fiber: impl Fiber + 'static) -> Result<FiberId, EngineError> {
        let scope = self.current_scope();
        self.core.add_fiber(scope, Vec::new(), Box::new(fiber))
    }

    /// Spawn a fiber in an existing scope
    pub fn spawn_in(
        &mut self,
        scope: ScopeId,
        fiber: impl Fiber + 'static,
    ) -> Result<FiberId, EngineError> {
        if !self.core.scopes.contains(scope) {
            return Err(EngineError::invalid_step(format!(
                "{} spawned into unknown {}",
                self.fiber, scope
            )));
        }
        self.core.add_fiber(scope, Vec::new(), Box::new(fiber))
    }

    /// Spawn a fiber in a fresh scope it owns
    ///
    /// The scope is a child of the caller's innermost scope and is released
    /// when the new fiber finishes.
    pub fn spawn_scoped(
        &mut self,
        detached: bool,
        fiber: impl Fiber + 'static,
    ) -> Result<(FiberId, ScopeId), EngineError> {
        let parent = self.current_scope();
        let scope = self
            .core
            .scopes
            .open(parent, detached)
            .ok_or_else(|| EngineError::invalid_step(format!("{} no longer exists", parent)))?;
        let id = self.core.add_fiber(scope, vec![scope], Box::new(fiber))?;
        Ok((id, scope))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn schedule_activity(
        &mut self,
        activity_type: impl Into<String>,
        input: impl Serialize,
        options: ActivityOptions,
    ) -> Result<OperationId, EngineError> {
        let activity_type = activity_type.into();
        let input = serde_json::to_value(input)?;
        let id = self.core.operations.allocate_id();
        let activity_id = options
            .activity_id
            .clone()
            .unwrap_or_else(|| id.0.to_string());

        let operation = Operation::Activity(ActivityOp::new(
            activity_id.clone(),
            activity_type.clone(),
            options.cancellation_type,
        ));
        let command = Command::ScheduleActivity {
            operation_id: id,
            activity_id,
            activity_type,
            input,
            options,
        };
        Ok(self.core.create_operation(self.fiber, id, operation, command))
    }

    pub fn start_timer(&mut self, duration: Duration) -> Result<OperationId, EngineError> {
        let id = self.core.operations.allocate_id();
        let operation = Operation::Timer(TimerOp::new(duration));
        let command = Command::StartTimer {
            operation_id: id,
            duration,
        };
        Ok(self.core.create_operation(self.fiber, id, operation, command))
    }

    pub fn start_child_workflow(
        &mut self,
        workflow_type: impl Into<String>,
        input: impl Serialize,
        options: ChildWorkflowOptions,
    ) -> Result<OperationId, EngineError> {
        let workflow_type = workflow_type.into();
        let input = serde_json::to_value(input)?;
        let id = self.core.operations.allocate_id();

        let operation = Operation::ChildWorkflow(ChildWorkflowOp::new(
            options.workflow_id.clone(),
            workflow_type.clone(),
            options.cancellation_type,
        ));
        let command = Command::StartChildWorkflow {
            operation_id: id,
            workflow_id: options.workflow_id.clone(),
            workflow_type,
            input,
            options,
        };
        Ok(self.core.create_operation(self.fiber, id, operation, command))
    }

    /// Ask an arbitrary workflow to cancel itself
    ///
    /// Resolves once the service delivers the request, or fails if it
    /// cannot.
    pub fn cancel_external_workflow(
        &mut self,
        workflow_id: impl Into<String>,
    ) -> Result<OperationId, EngineError> {
        let workflow_id = workflow_id.into();
        let id = self.core.operations.allocate_id();
        let operation = Operation::CancelRequest(CancelRequestOp::new(workflow_id.clone(), None));
        let command = Command::RequestCancelExternalWorkflow {
            operation_id: id,
            workflow_id,
            child_operation: None,
        };
        Ok(self.core.create_operation(self.fiber, id, operation, command))
    }

    /// Current state of an operation, while the run still tracks it
    pub fn operation_state(&self, id: OperationId) -> Option<OperationState> {
        self.core.operations.get(id).map(|r| r.state)
    }

    // =========================================================================
    // Deterministic helpers
    // =========================================================================

    /// Version of `change_id` this run executes
    ///
    /// The first live call records `max_supported`; a replay returns what
    /// was recorded, or [`DEFAULT_VERSION`](crate::versioning::DEFAULT_VERSION)
    /// for histories written before the change existed.
    pub fn get_version(
        &mut self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<i32, EngineError> {
        let decision = self.core.versions.resolve(
            change_id,
            min_supported,
            max_supported,
            self.core.replaying,
        )?;

        if let VersionDecision::Recorded(version) | VersionDecision::Replayed(version) = decision {
            self.core.commands.push(Command::RecordMarker {
                marker: Marker::Version {
                    change_id: change_id.to_string(),
                    version,
                },
            });
            self.core.progress += 1;
        }

        debug!(change_id, ?decision, "version resolved");
        Ok(decision.version())
    }

    /// Run `f` once and record its result; replays return the recorded value
    pub fn side_effect<T, F>(&mut self, f: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let side_effect_id = self.core.side_effects.next_id();

        let value = if self.core.replaying {
            self.core.side_effects.take(side_effect_id).ok_or_else(|| {
                NonDeterminismError::new(format!(
                    "side effect {} has no recorded value",
                    side_effect_id
                ))
            })?
        } else {
            serde_json::to_value(f())?
        };

        let result = serde_json::from_value(value.clone())?;
        self.core.commands.push(Command::RecordMarker {
            marker: Marker::SideEffect {
                side_effect_id,
                value,
            },
        });
        self.core.progress += 1;
        Ok(result)
    }

    /// Deterministic UUID derived from the run id and a per-run counter
    pub fn random_uuid(&mut self) -> Uuid {
        self.core.uuid_counter += 1;
        Uuid::new_v5(&self.core.run.run_id, &self.core.uuid_counter.to_be_bytes())
    }
}
