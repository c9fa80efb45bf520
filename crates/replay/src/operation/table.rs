//! Pending-operation table keyed by operation id

use std::collections::BTreeMap;

use serde::Serialize;

use super::{
    Effect, Operation, OperationFailure, OperationId, OperationKind, OperationState,
    StateMachine,
};
use crate::history::EventAttributes;
use crate::scope::ScopeId;
use crate::workflow::{CancellationSignal, CancellationType, FiberId, Resolution};

/// One operation plus its bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub operation: Operation,
    pub state: OperationState,

    /// Scope the operation was created under
    pub scope: ScopeId,

    /// Set once scope cancellation reached this operation
    #[serde(skip)]
    pub(crate) cancel_signal: Option<CancellationSignal>,

    /// Cancellation requested before the service acknowledged the command
    #[serde(skip)]
    pub(crate) pending_cancel: bool,

    /// Outcome for the awaiting fiber, fixed at first resolution
    #[serde(skip)]
    pub(crate) outcome: Option<Resolution>,

    /// The outcome has been handed to a fiber
    pub delivered: bool,

    /// Fiber blocked on this operation
    pub waiter: Option<FiberId>,
}

impl OperationRecord {
    pub fn new(id: OperationId, operation: Operation, scope: ScopeId) -> Self {
        Self {
            id,
            operation,
            state: OperationState::Initiated,
            scope,
            cancel_signal: None,
            pending_cancel: false,
            outcome: None,
            delivered: false,
            waiter: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_signal.is_some()
    }

    /// Whether the awaiting fiber's outcome is already decided
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// A cancel request the engine sent for a child; no fiber awaits it
    pub fn is_internal(&self) -> bool {
        matches!(&self.operation, Operation::CancelRequest(op) if op.child.is_some())
    }

    fn cancelled(&self) -> Option<Resolution> {
        self.cancel_signal.clone().map(Resolution::Cancelled)
    }
}

/// What the engine must do to carry out an operation's cancellation
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CancelAction {
    /// Already resolved, already cancelling, or not cancellable
    None,

    /// The initiating command has not been acknowledged; withdraw it
    Retract,

    CancelTimer,

    /// Resolve without telling the target
    Abandon,

    RequestCancelActivity { resolve_now: bool },

    RequestCancelChild { workflow_id: String, resolve_now: bool },
}

/// Consequences of an event accepted by an operation
#[derive(Debug, Default)]
pub(crate) struct EventOutcome {
    /// First resolution of the targeted operation
    pub resolution: Option<Resolution>,

    /// Resolution of the child a delivered cancel request was sent for
    pub linked: Option<(OperationId, Resolution)>,

    /// A cancellation that was waiting for the service's acknowledgment
    pub apply_pending_cancel: bool,
}

/// Why an event could not be applied
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub(crate) enum TableError {
    #[error("event references unknown operation {0}")]
    UnknownOperation(OperationId),

    #[error("{kind:?} operation {id} cannot accept {event} in state {state}")]
    InvalidTransition {
        id: OperationId,
        kind: OperationKind,
        state: OperationState,
        event: String,
    },
}

/// All operations of a run that are not yet fully retired
///
/// Ids are allocated here so they stay sequential. Records are removed
/// once their target has ended and the outcome has reached a fiber.
#[derive(Debug, Clone)]
pub struct OperationTable {
    records: BTreeMap<OperationId, OperationRecord>,
    next_id: u64,
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationTable {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn allocate_id(&mut self) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Whether this id was ever handed out in this run
    pub fn was_issued(&self, id: OperationId) -> bool {
        id.0 >= 1 && id.0 < self.next_id
    }

    pub(crate) fn insert(&mut self, record: OperationRecord) {
        self.records.insert(record.id, record);
    }

    pub fn get(&self, id: OperationId) -> Option<&OperationRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: OperationId) -> Option<&mut OperationRecord> {
        self.records.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: OperationId) -> Option<OperationRecord> {
        self.records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate records in id order
    pub fn iter(&self) -> impl Iterator<Item = &OperationRecord> {
        self.records.values()
    }

    /// Unresolved operations created under any of `scopes`, in id order
    pub(crate) fn unresolved_in_scopes(&self, scopes: &[ScopeId]) -> Vec<OperationId> {
        self.records
            .values()
            .filter(|r| !r.is_resolved() && scopes.contains(&r.scope))
            .map(|r| r.id)
            .collect()
    }

    /// Move operations of a destroyed scope to its parent
    pub(crate) fn reassign_scope(&mut self, from: ScopeId, to: ScopeId) {
        for record in self.records.values_mut().filter(|r| r.scope == from) {
            record.scope = to;
        }
    }

    /// Record the decided outcome; returns false if one was already set
    pub(crate) fn set_outcome(&mut self, id: OperationId, resolution: Resolution) -> bool {
        match self.records.get_mut(&id) {
            Some(record) if record.outcome.is_none() => {
                record.outcome = Some(resolution);
                true
            }
            _ => false,
        }
    }

    /// Start cancelling an operation
    pub(crate) fn begin_cancel(
        &mut self,
        id: OperationId,
        signal: CancellationSignal,
    ) -> CancelAction {
        let Some(record) = self.records.get_mut(&id) else {
            return CancelAction::None;
        };
        if record.is_resolved()
            || record.is_cancel_requested()
            || record.operation.cancellation_type().is_none()
        {
            return CancelAction::None;
        }

        record.cancel_signal = Some(signal);
        match record.state {
            OperationState::Initiated => CancelAction::Retract,
            OperationState::Scheduled => self.cancel_scheduled(id),
            _ => CancelAction::None,
        }
    }

    /// Transition a scheduled operation for cancellation per its policy
    pub(crate) fn cancel_scheduled(&mut self, id: OperationId) -> CancelAction {
        let Some(record) = self.records.get_mut(&id) else {
            return CancelAction::None;
        };
        record.pending_cancel = false;

        let Some(cancellation_type) = record.operation.cancellation_type() else {
            return CancelAction::None;
        };
        let resolve_now = cancellation_type.resolves_immediately();

        match (&record.operation, cancellation_type) {
            (Operation::Timer(_), _) => {
                record.state = OperationState::Canceled;
                CancelAction::CancelTimer
            }
            (_, CancellationType::Abandon) => {
                record.state = OperationState::Abandoned;
                CancelAction::Abandon
            }
            (Operation::Activity(_), _) => {
                record.state = OperationState::AwaitingCancelConfirmation;
                CancelAction::RequestCancelActivity { resolve_now }
            }
            (Operation::ChildWorkflow(child), _) => {
                let workflow_id = child.workflow_id.clone();
                record.state = OperationState::AwaitingCancelConfirmation;
                CancelAction::RequestCancelChild {
                    workflow_id,
                    resolve_now,
                }
            }
            (Operation::CancelRequest(_), _) => CancelAction::None,
        }
    }

    /// Note the cancel request operation sent on a child's behalf
    pub(crate) fn link_cancel_request(&mut self, child: OperationId, request: OperationId) {
        if let Some(Operation::ChildWorkflow(op)) =
            self.records.get_mut(&child).map(|r| &mut r.operation)
        {
            op.cancel_request = Some(request);
        }
    }

    pub(crate) fn mark_retracted(&mut self, id: OperationId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.state = OperationState::Canceled;
        }
    }

    pub(crate) fn mark_pending_cancel(&mut self, id: OperationId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.pending_cancel = true;
        }
    }

    /// Resolution to deliver for a cancellation that resolves at once
    pub(crate) fn cancelled_resolution(&self, id: OperationId) -> Option<Resolution> {
        self.records.get(&id).and_then(|r| r.cancelled())
    }

    /// Drive an operation's state machine with a history event
    pub(crate) fn apply_event(
        &mut self,
        id: OperationId,
        event: &EventAttributes,
    ) -> Result<EventOutcome, TableError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(TableError::UnknownOperation(id))?;

        let previous = record.state;
        let transition = record.operation.apply(previous, event).ok_or_else(|| {
            TableError::InvalidTransition {
                id,
                kind: record.operation.kind(),
                state: previous,
                event: event.kind().to_string(),
            }
        })?;
        record.state = transition.state;

        let mut outcome = EventOutcome {
            apply_pending_cancel: record.pending_cancel
                && previous == OperationState::Initiated
                && transition.state == OperationState::Scheduled,
            ..EventOutcome::default()
        };

        let resolution = match transition.effect {
            Effect::None => None,
            Effect::Completed(value) => Some(Resolution::Completed(value)),
            Effect::Failed(failure) => Some(Resolution::Failed(failure)),
            Effect::Canceled => record.cancelled().or_else(|| {
                let failure = match record.operation.kind() {
                    OperationKind::ChildWorkflow => OperationFailure::ChildCanceled,
                    _ => OperationFailure::ActivityCanceled,
                };
                Some(Resolution::Failed(failure))
            }),
            Effect::CancelAcknowledged => match record.operation.cancellation_type() {
                Some(CancellationType::WaitCancellationRequested) => record.cancelled(),
                _ => None,
            },
            Effect::Delivered => {
                let child = match &record.operation {
                    Operation::CancelRequest(op) => op.child,
                    _ => None,
                };
                if let Some(child) = child {
                    outcome.linked = self.delivered_to_child(child).map(|r| (child, r));
                }
                Some(Resolution::Completed(serde_json::Value::Null))
            }
        };

        // Only the first resolution counts; later events still move the state
        if let Some(record) = self.records.get(&id) {
            if !record.is_resolved() {
                outcome.resolution = resolution;
            }
        }
        Ok(outcome)
    }

    fn delivered_to_child(&self, child: OperationId) -> Option<Resolution> {
        let record = self.records.get(&child)?;
        if record.is_resolved() {
            return None;
        }
        match record.operation.cancellation_type() {
            Some(CancellationType::WaitCancellationRequested) => record.cancelled(),
            _ => None,
        }
    }

    /// Whether a record can be retired
    ///
    /// The target must have ended, and the outcome must have reached a
    /// fiber. Cancel requests sent on a child's behalf have no fiber to
    /// reach. The caller still checks for commands awaiting their echo.
    pub(crate) fn is_retired(&self, id: OperationId) -> bool {
        self.records
            .get(&id)
            .map(|r| (r.delivered || r.is_internal()) && r.state.is_terminal())
            .unwrap_or(false)
    }
}
