//! Timer state machine

use std::time::Duration;

use serde::Serialize;

use super::{Effect, OperationState, StateMachine, Transition};
use crate::history::EventAttributes;
use crate::serde_millis;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimerOp {
    #[serde(with = "serde_millis")]
    pub duration: Duration,
}

impl TimerOp {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl StateMachine for TimerOp {
    fn apply(&mut self, state: OperationState, event: &EventAttributes) -> Option<Transition> {
        use OperationState::*;

        match (state, event) {
            (Initiated, EventAttributes::TimerStarted { .. }) => Some(Transition::to(Scheduled)),
            (Scheduled, EventAttributes::TimerFired { .. }) => Some(Transition::with(
                Completed,
                Effect::Completed(serde_json::Value::Null),
            )),
            // Cancel echo, or a fire that raced the cancel
            (Canceled, EventAttributes::TimerCanceled { .. })
            | (Canceled, EventAttributes::TimerFired { .. }) => Some(Transition::to(Canceled)),
            _ => None,
        }
    }
}
