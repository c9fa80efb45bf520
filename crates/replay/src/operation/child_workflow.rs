//! Child workflow state machine

use serde::Serialize;
use uuid::Uuid;

use super::{Effect, OperationFailure, OperationId, OperationState, StateMachine, Transition};
use crate::history::EventAttributes;
use crate::workflow::CancellationType;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChildWorkflowOp {
    pub workflow_id: String,
    pub workflow_type: String,
    pub cancellation_type: CancellationType,

    /// Run id reported once the child started
    pub child_run_id: Option<Uuid>,

    /// Cancel request sent on behalf of this child, if any
    pub cancel_request: Option<OperationId>,
}

impl ChildWorkflowOp {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        cancellation_type: CancellationType,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            cancellation_type,
            child_run_id: None,
            cancel_request: None,
        }
    }
}

impl StateMachine for ChildWorkflowOp {
    fn apply(&mut self, state: OperationState, event: &EventAttributes) -> Option<Transition> {
        use OperationState::*;

        match (state, event) {
            (Initiated, EventAttributes::StartChildWorkflowExecutionInitiated { .. }) => {
                Some(Transition::to(Scheduled))
            }
            (s, EventAttributes::StartChildWorkflowExecutionFailed { cause, .. })
                if s.is_running() && self.child_run_id.is_none() =>
            {
                Some(Transition::with(
                    Failed,
                    Effect::Failed(OperationFailure::ChildStartFailed {
                        cause: cause.clone(),
                    }),
                ))
            }
            (s, EventAttributes::ChildWorkflowExecutionStarted { run_id, .. })
                if s.is_running() && self.child_run_id.is_none() =>
            {
                self.child_run_id = Some(*run_id);
                Some(Transition::to(s))
            }
            (s, EventAttributes::ChildWorkflowExecutionCompleted { result, .. })
                if s.is_running() =>
            {
                Some(Transition::with(
                    Completed,
                    Effect::Completed(result.clone()),
                ))
            }
            (s, EventAttributes::ChildWorkflowExecutionFailed { failure, .. })
                if s.is_running() =>
            {
                Some(Transition::with(
                    Failed,
                    Effect::Failed(OperationFailure::ChildFailed {
                        failure: failure.clone(),
                    }),
                ))
            }
            (s, EventAttributes::ChildWorkflowExecutionTimedOut { .. }) if s.is_running() => {
                Some(Transition::with(
                    TimedOut,
                    Effect::Failed(OperationFailure::ChildTimedOut),
                ))
            }
            (s, EventAttributes::ChildWorkflowExecutionTerminated { .. }) if s.is_running() => {
                Some(Transition::with(
                    Failed,
                    Effect::Failed(OperationFailure::ChildTerminated),
                ))
            }
            (s, EventAttributes::ChildWorkflowExecutionCanceled { .. }) if s.is_running() => {
                Some(Transition::with(Canceled, Effect::Canceled))
            }
            _ => None,
        }
    }
}
