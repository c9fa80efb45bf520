//! External cancel request state machine
//!
//! Initiated → Scheduled → {Completed (delivered) | Failed}

use serde::Serialize;

use super::{Effect, OperationFailure, OperationId, OperationState, StateMachine, Transition};
use crate::history::EventAttributes;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CancelRequestOp {
    /// Workflow the request targets
    pub workflow_id: String,

    /// Child operation this request was sent for, when it came from scope
    /// cancellation rather than an explicit call
    pub child: Option<OperationId>,
}

impl CancelRequestOp {
    pub fn new(workflow_id: impl Into<String>, child: Option<OperationId>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            child,
        }
    }
}

impl StateMachine for CancelRequestOp {
    fn apply(&mut self, state: OperationState, event: &EventAttributes) -> Option<Transition> {
        use OperationState::*;

        match (state, event) {
            (
                Initiated,
                EventAttributes::RequestCancelExternalWorkflowExecutionInitiated { .. },
            ) => Some(Transition::to(Scheduled)),
            (Scheduled, EventAttributes::ExternalWorkflowExecutionCancelRequested { .. }) => {
                Some(Transition::with(Completed, Effect::Delivered))
            }
            (
                Scheduled,
                EventAttributes::RequestCancelExternalWorkflowExecutionFailed { cause, .. },
            ) => {
                Some(Transition::with(
                    Failed,
                    Effect::Failed(OperationFailure::CancelRequestFailed {
                        cause: cause.clone(),
                    }),
                ))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivered() {
        let mut op = CancelRequestOp::new("child-1", Some(OperationId(1)));
        let scheduled = op
            .apply(
                OperationState::Initiated,
                &EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                    operation_id: OperationId(2),
                    workflow_id: "child-1".to_string(),
                },
            )
            .unwrap();
        assert_eq!(scheduled.state, OperationState::Scheduled);

        let delivered = op
            .apply(
                OperationState::Scheduled,
                &EventAttributes::ExternalWorkflowExecutionCancelRequested {
                    operation_id: OperationId(2),
                },
            )
            .unwrap();
        assert_eq!(delivered.state, OperationState::Completed);
        assert_eq!(delivered.effect, Effect::Delivered);
    }

    #[test]
    fn test_failed() {
        let mut op = CancelRequestOp::new("gone", None);
        let failed = op
            .apply(
                OperationState::Scheduled,
                &EventAttributes::RequestCancelExternalWorkflowExecutionFailed {
                    operation_id: OperationId(4),
                    cause: "not found".to_string(),
                },
            )
            .unwrap();
        assert_eq!(failed.state, OperationState::Failed);
    }

    #[test]
    fn test_delivery_before_initiation_is_rejected() {
        let mut op = CancelRequestOp::new("child-1", None);
        assert!(op
            .apply(
                OperationState::Initiated,
                &EventAttributes::ExternalWorkflowExecutionCancelRequested {
                    operation_id: OperationId(2),
                },
            )
            .is_none());
    }
}
