//! Activity state machine

use serde::Serialize;

use super::{Effect, OperationFailure, OperationState, StateMachine, Transition};
use crate::history::EventAttributes;
use crate::workflow::CancellationType;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActivityOp {
    pub activity_id: String,
    pub activity_type: String,
    pub cancellation_type: CancellationType,
}

impl ActivityOp {
    pub fn new(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        cancellation_type: CancellationType,
    ) -> Self {
        Self {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            cancellation_type,
        }
    }
}

impl StateMachine for ActivityOp {
    fn apply(&mut self, state: OperationState, event: &EventAttributes) -> Option<Transition> {
        use OperationState::*;

        match (state, event) {
            (Initiated, EventAttributes::ActivityTaskScheduled { .. }) => {
                Some(Transition::to(Scheduled))
            }
            (AwaitingCancelConfirmation, EventAttributes::ActivityTaskCancelRequested { .. }) => {
                Some(Transition::with(state, Effect::CancelAcknowledged))
            }
            // The activity ended before the cancel request was recorded
            (s, EventAttributes::ActivityTaskCancelRequested { .. }) if s.is_terminal() => {
                Some(Transition::to(s))
            }
            (s, EventAttributes::ActivityTaskCompleted { result, .. }) if s.is_running() => Some(
                Transition::with(Completed, Effect::Completed(result.clone())),
            ),
            (s, EventAttributes::ActivityTaskFailed { failure, .. }) if s.is_running() => {
                Some(Transition::with(
                    Failed,
                    Effect::Failed(OperationFailure::ActivityFailed {
                        failure: failure.clone(),
                    }),
                ))
            }
            (s, EventAttributes::ActivityTaskTimedOut { timeout_type, .. }) if s.is_running() => {
                Some(Transition::with(
                    TimedOut,
                    Effect::Failed(OperationFailure::ActivityTimedOut {
                        timeout_type: *timeout_type,
                    }),
                ))
            }
            (s, EventAttributes::ActivityTaskCanceled { .. }) if s.is_running() => {
                Some(Transition::with(Canceled, Effect::Canceled))
            }
            _ => None,
        }
    }
}
