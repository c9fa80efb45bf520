//! Per-run mutable state shared by the scheduler and workflow contexts

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::EngineError;
use crate::command::{Command, CommandBuilder};
use crate::operation::{
    CancelAction, CancelRequestOp, EventOutcome, Operation, OperationId, OperationRecord,
    OperationState, OperationTable,
};
use crate::scope::{ScopeId, ScopeTree};
use crate::versioning::VersionTable;
use crate::workflow::{
    Awaitable, CancellationSignal, Fiber, FiberId, FiberState, Resolution, Wakeup, WorkflowError,
};

/// Identity of the run being executed
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunInfo {
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub input: Value,
    pub started_at: DateTime<Utc>,
}

/// Scheduler bookkeeping for one fiber
#[derive(Debug)]
pub(crate) struct FiberRecord {
    pub id: FiberId,
    pub state: FiberState,

    /// Innermost scope last; the first entry is where the fiber was spawned
    pub scope_stack: Vec<ScopeId>,

    /// Scopes destroyed when the fiber finishes
    pub owned_scopes: Vec<ScopeId>,

    /// Output kept until another fiber joins this one
    pub outcome: Option<Result<Value, WorkflowError>>,

    pub waiter: Option<FiberId>,
    pub joined: bool,
}

impl FiberRecord {
    pub fn current_scope(&self) -> ScopeId {
        self.scope_stack.last().copied().unwrap_or(ScopeId::ROOT)
    }
}

/// Side effect values recorded in history, by side effect id
#[derive(Debug, Default)]
pub(crate) struct SideEffectLog {
    next_id: u64,
    preloaded: BTreeMap<u64, Value>,
}

impl SideEffectLog {
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn preload(&mut self, id: u64, value: Value) {
        self.preloaded.insert(id, value);
    }

    pub fn take(&mut self, id: u64) -> Option<Value> {
        self.preloaded.remove(&id)
    }
}

/// Everything fibers may touch, kept apart from the fiber bodies so a
/// context can borrow it while a body runs
pub(crate) struct RunCore {
    pub run: RunInfo,
    pub scopes: ScopeTree,
    pub operations: OperationTable,
    pub versions: VersionTable,
    pub side_effects: SideEffectLog,
    pub commands: CommandBuilder,
    pub fibers: Vec<FiberRecord>,

    /// Bodies of fibers spawned during the current resume
    pub spawned: Vec<Box<dyn Fiber>>,

    pub replaying: bool,

    /// Timestamp of the last event processed before the current round
    pub now: DateTime<Utc>,

    pub uuid_counter: u64,

    /// Bumped on every state change; a pass without change is a fixed point
    pub progress: u64,

    pub max_fibers: usize,

    /// A terminal command has been produced; fibers no longer run
    pub closing: bool,
}

impl RunCore {
    pub fn new(run: RunInfo, max_fibers: usize) -> Self {
        let now = run.started_at;
        Self {
            run,
            scopes: ScopeTree::new(),
            operations: OperationTable::new(),
            versions: VersionTable::new(),
            side_effects: SideEffectLog::default(),
            commands: CommandBuilder::new(),
            fibers: Vec::new(),
            spawned: Vec::new(),
            replaying: false,
            now,
            uuid_counter: 0,
            progress: 0,
            max_fibers,
            closing: false,
        }
    }

    pub fn fiber(&self, id: FiberId) -> Result<&FiberRecord, EngineError> {
        self.fibers
            .get(id.0)
            .ok_or_else(|| EngineError::invalid_step(format!("unknown fiber {}", id)))
    }

    pub fn fiber_mut(&mut self, id: FiberId) -> Result<&mut FiberRecord, EngineError> {
        self.fibers
            .get_mut(id.0)
            .ok_or_else(|| EngineError::invalid_step(format!("unknown fiber {}", id)))
    }

    /// Whether a round would resume a fiber or send a command
    ///
    /// Fibers that only yielded do not count; they resume with the next
    /// round that runs for another reason.
    pub fn has_pending_work(&self) -> bool {
        !self.commands.outbox().is_empty()
            || self.fibers.iter().any(|f| {
                matches!(
                    f.state,
                    FiberState::Runnable(Wakeup::Start | Wakeup::Resolved(_))
                )
            })
    }

    pub fn current_scope(&self, fiber: FiberId) -> ScopeId {
        self.fibers
            .get(fiber.0)
            .map(FiberRecord::current_scope)
            .unwrap_or(ScopeId::ROOT)
    }

    /// Register a new fiber; its body is picked up after the current resume
    pub fn add_fiber(
        &mut self,
        base_scope: ScopeId,
        owned_scopes: Vec<ScopeId>,
        body: Box<dyn Fiber>,
    ) -> Result<FiberId, EngineError> {
        if self.fibers.len() >= self.max_fibers {
            return Err(EngineError::LimitExceeded(format!(
                "run already has {} fibers",
                self.fibers.len()
            )));
        }

        let id = FiberId(self.fibers.len());
        self.fibers.push(FiberRecord {
            id,
            state: FiberState::Runnable(Wakeup::Start),
            scope_stack: vec![base_scope],
            owned_scopes,
            outcome: None,
            waiter: None,
            joined: false,
        });
        self.spawned.push(body);
        self.progress += 1;
        debug!(fiber = %id, scope = %base_scope, "fiber spawned");
        Ok(id)
    }

    /// Create an operation under the fiber's innermost scope
    ///
    /// An operation created in a cancelled scope resolves as cancelled at
    /// once and emits nothing.
    pub fn create_operation(
        &mut self,
        fiber: FiberId,
        id: OperationId,
        operation: Operation,
        command: Command,
    ) -> OperationId {
        let scope = self.current_scope(fiber);
        let mut record = OperationRecord::new(id, operation, scope);
        let cancellable = record.operation.cancellation_type().is_some();

        if cancellable && self.scopes.is_cancel_requested(scope) {
            let signal = CancellationSignal {
                scope,
                operation: Some(id),
                reason: "scope already cancelled".to_string(),
            };
            record.state = OperationState::Canceled;
            record.cancel_signal = Some(signal.clone());
            record.outcome = Some(Resolution::Cancelled(signal));
            debug!(operation_id = %id, scope = %scope, "operation created in cancelled scope");
        } else {
            self.commands.push(command);
            debug!(operation_id = %id, kind = ?record.kind(), scope = %scope, "operation created");
        }

        self.operations.insert(record);
        self.progress += 1;
        id
    }

    /// Cancel a scope and the operations it reaches, in id order
    pub fn request_cancel(&mut self, scope: ScopeId, reason: &str) {
        let changed = self.scopes.request_cancel(scope);
        if changed.is_empty() {
            return;
        }
        self.progress += 1;
        debug!(scope = %scope, scopes = changed.len(), reason, "scope cancellation requested");
        self.cancel_operations(&changed, scope, reason);
    }

    fn cancel_operations(&mut self, scopes: &[ScopeId], origin: ScopeId, reason: &str) {
        for id in self.operations.unresolved_in_scopes(scopes) {
            let signal = CancellationSignal {
                scope: origin,
                operation: Some(id),
                reason: reason.to_string(),
            };
            let action = self.operations.begin_cancel(id, signal);
            self.execute_cancel(id, action);
        }
    }

    /// Destroy a scope and hand what it still holds to its parent
    ///
    /// Fibers running in the scope, its operations, and its child scopes
    /// all move up one level. Contents of a detached scope that land in a
    /// cancelled parent are cancelled with it.
    pub fn release_scope(&mut self, scope: ScopeId) {
        let was_cancelled = self.scopes.is_cancel_requested(scope);
        let Some(parent) = self.scopes.destroy(scope) else {
            return;
        };

        self.operations.reassign_scope(scope, parent);
        for fiber in &mut self.fibers {
            for entry in fiber.scope_stack.iter_mut().filter(|s| **s == scope) {
                *entry = parent;
            }
        }
        self.progress += 1;
        debug!(scope = %scope, parent = %parent, "scope released");

        if !was_cancelled && self.scopes.is_cancel_requested(parent) {
            let mut reached = vec![parent];
            reached.extend(self.scopes.request_cancel(parent));
            self.cancel_operations(&reached, parent, "enclosing scope cancelled");
        }
    }

    fn execute_cancel(&mut self, id: OperationId, action: CancelAction) {
        debug!(operation_id = %id, action = ?action, "cancelling operation");

        match action {
            CancelAction::None => return,
            CancelAction::Retract => {
                if self.commands.retract(id) {
                    self.operations.mark_retracted(id);
                    self.resolve_cancelled(id);
                } else {
                    // Command already sent; cancel once the service records it
                    self.operations.mark_pending_cancel(id);
                }
            }
            CancelAction::CancelTimer => {
                self.commands.push(Command::CancelTimer { operation_id: id });
                self.resolve_cancelled(id);
            }
            CancelAction::Abandon => self.resolve_cancelled(id),
            CancelAction::RequestCancelActivity { resolve_now } => {
                self.commands
                    .push(Command::RequestCancelActivity { operation_id: id });
                if resolve_now {
                    self.resolve_cancelled(id);
                }
            }
            CancelAction::RequestCancelChild {
                workflow_id,
                resolve_now,
            } => {
                let scope = self
                    .operations
                    .get(id)
                    .map(|r| r.scope)
                    .unwrap_or(ScopeId::ROOT);
                let request = self.operations.allocate_id();
                self.operations.insert(OperationRecord::new(
                    request,
                    Operation::CancelRequest(CancelRequestOp::new(workflow_id.clone(), Some(id))),
                    scope,
                ));
                self.operations.link_cancel_request(id, request);
                self.commands.push(Command::RequestCancelExternalWorkflow {
                    operation_id: request,
                    workflow_id,
                    child_operation: Some(id),
                });
                if resolve_now {
                    self.resolve_cancelled(id);
                }
            }
        }
        self.progress += 1;
    }

    fn resolve_cancelled(&mut self, id: OperationId) {
        if let Some(resolution) = self.operations.cancelled_resolution(id) {
            self.resolve(id, resolution);
        }
    }

    /// Fix an operation's outcome and wake its waiter, if any
    pub fn resolve(&mut self, id: OperationId, resolution: Resolution) {
        if self.operations.set_outcome(id, resolution) {
            self.progress += 1;
            debug!(operation_id = %id, "operation resolved");
            self.try_deliver(id);
        }
    }

    fn try_deliver(&mut self, id: OperationId) {
        let Some(record) = self.operations.get_mut(id) else {
            return;
        };
        let (Some(waiter), Some(outcome)) = (record.waiter, record.outcome.clone()) else {
            return;
        };
        record.waiter = None;
        record.delivered = true;

        if let Some(fiber) = self.fibers.get_mut(waiter.0) {
            fiber.state = FiberState::Runnable(Wakeup::Resolved(outcome));
        }
        self.try_retire(id);
    }

    pub fn try_retire(&mut self, id: OperationId) {
        if self.operations.is_retired(id) && !self.commands.has_pending(id) {
            self.operations.remove(id);
            debug!(operation_id = %id, "operation retired");
        }
    }

    /// Apply the consequences of an event accepted by an operation
    pub fn apply_event_outcome(&mut self, id: OperationId, outcome: EventOutcome) {
        self.progress += 1;
        if outcome.apply_pending_cancel {
            let action = self.operations.cancel_scheduled(id);
            self.execute_cancel(id, action);
        }
        if let Some(resolution) = outcome.resolution {
            self.resolve(id, resolution);
        }
        if let Some((child, resolution)) = outcome.linked {
            self.resolve(child, resolution);
        }
        self.try_retire(id);
    }

    /// Block `fiber` on an awaitable, or hand back its outcome if ready
    pub fn await_on(
        &mut self,
        fiber: FiberId,
        awaiting: Awaitable,
    ) -> Result<Option<Resolution>, EngineError> {
        match awaiting {
            Awaitable::Operation(id) => self.await_operation(fiber, id),
            Awaitable::Fiber(target) => self.await_fiber(fiber, target),
        }
    }

    fn await_operation(
        &mut self,
        fiber: FiberId,
        id: OperationId,
    ) -> Result<Option<Resolution>, EngineError> {
        let Some(record) = self.operations.get_mut(id) else {
            let reason = if self.operations.was_issued(id) {
                "was already consumed"
            } else {
                "does not exist"
            };
            return Err(EngineError::invalid_step(format!(
                "{} awaited {} which {}",
                fiber, id, reason
            )));
        };

        if record.delivered {
            return Err(EngineError::invalid_step(format!(
                "{} awaited {} whose outcome was already delivered",
                fiber, id
            )));
        }
        if let Some(other) = record.waiter {
            return Err(EngineError::invalid_step(format!(
                "{} awaited {} which {} is already awaiting",
                fiber, id, other
            )));
        }

        match record.outcome.clone() {
            Some(outcome) => {
                record.delivered = true;
                self.try_retire(id);
                Ok(Some(outcome))
            }
            None => {
                record.waiter = Some(fiber);
                Ok(None)
            }
        }
    }

    fn await_fiber(
        &mut self,
        fiber: FiberId,
        target: FiberId,
    ) -> Result<Option<Resolution>, EngineError> {
        if fiber == target {
            return Err(EngineError::invalid_step(format!("{} awaited itself", fiber)));
        }
        let record = self.fiber_mut(target)?;
        if record.joined || record.waiter.is_some() {
            return Err(EngineError::invalid_step(format!(
                "{} awaited {} which is already joined",
                fiber, target
            )));
        }

        match record.outcome.take() {
            Some(outcome) => {
                record.joined = true;
                Ok(Some(fiber_resolution(outcome)))
            }
            None => {
                record.waiter = Some(fiber);
                Ok(None)
            }
        }
    }

    /// Mark a fiber finished, release its scopes, and wake its joiner
    pub fn finish_fiber(&mut self, id: FiberId, outcome: Result<Value, WorkflowError>) {
        let Some(record) = self.fibers.get_mut(id.0) else {
            return;
        };
        record.state = match outcome {
            Ok(_) => FiberState::Completed,
            Err(_) => FiberState::Failed,
        };
        let owned = std::mem::take(&mut record.owned_scopes);
        let waiter = record.waiter.take();
        match waiter {
            Some(_) => record.joined = true,
            None => record.outcome = Some(outcome.clone()),
        }

        // Innermost first so each scope's contents move up one level at a time
        for scope in owned.into_iter().rev() {
            self.release_scope(scope);
        }

        if let Some(waiter) = waiter {
            if let Some(joiner) = self.fibers.get_mut(waiter.0) {
                joiner.state = FiberState::Runnable(Wakeup::Resolved(fiber_resolution(outcome)));
            }
        }
        self.progress += 1;
        debug!(fiber = %id, "fiber finished");
    }
}

fn fiber_resolution(outcome: Result<Value, WorkflowError>) -> Resolution {
    match outcome {
        Ok(value) => Resolution::Completed(value),
        Err(error) => Resolution::FiberFailed(error),
    }
}
