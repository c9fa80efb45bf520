//! Operation state machines
//!
//! Every activity, timer, child workflow, and external cancel request the
//! workflow issues gets an [`OperationId`] and a small state machine. The
//! machines are driven only by history events carrying that id, plus scope
//! cancellation; their terminal outcomes are delivered back to the one fiber
//! awaiting them.

mod activity;
mod cancel_request;
mod child_workflow;
mod table;
mod timer;

use serde::{Deserialize, Serialize};

use crate::history::{EventAttributes, FailureInfo, TimeoutType};
use crate::workflow::CancellationType;

pub use activity::ActivityOp;
pub use cancel_request::CancelRequestOp;
pub use child_workflow::ChildWorkflowOp;
pub use table::{OperationRecord, OperationTable};
pub use timer::TimerOp;

pub(crate) use table::{CancelAction, EventOutcome, TableError};

/// Identifier the engine assigns to an operation
///
/// Allocated sequentially from 1 in the order workflow code issues
/// operations, so a replay regenerates the same ids.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// The closed set of operation kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Activity,
    Timer,
    ChildWorkflow,
    CancelRequest,
}

/// Lifecycle state shared by every operation kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Command produced, not yet acknowledged by the service
    Initiated,

    /// The service recorded the command
    Scheduled,

    /// A cancel request was sent; the target has not ended yet
    AwaitingCancelConfirmation,

    Completed,
    Failed,
    Canceled,
    TimedOut,

    /// Cancelled without telling the target, which keeps running
    Abandoned,
}

impl OperationState {
    /// Whether the target itself has ended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    /// Whether the target may still produce events
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::AwaitingCancelConfirmation | Self::Abandoned
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A failure delivered to the fiber awaiting an operation
///
/// These are ordinary values: workflow code decides whether to recover,
/// compensate, or fail itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationFailure {
    #[error("activity failed: {failure}")]
    ActivityFailed { failure: FailureInfo },

    #[error("activity timed out ({timeout_type:?})")]
    ActivityTimedOut { timeout_type: TimeoutType },

    /// The activity was canceled without the workflow asking for it
    #[error("activity was canceled")]
    ActivityCanceled,

    #[error("child workflow failed to start: {cause}")]
    ChildStartFailed { cause: String },

    #[error("child workflow failed: {failure}")]
    ChildFailed { failure: FailureInfo },

    #[error("child workflow timed out")]
    ChildTimedOut,

    /// The child was canceled without the workflow asking for it
    #[error("child workflow was canceled")]
    ChildCanceled,

    #[error("child workflow was terminated")]
    ChildTerminated,

    #[error("cancel request failed: {cause}")]
    CancelRequestFailed { cause: String },
}

/// What an accepted event means for the awaiting fiber
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Effect {
    None,
    Completed(serde_json::Value),
    Failed(OperationFailure),

    /// The target ended as canceled
    Canceled,

    /// The service recorded our cancel request against the target
    CancelAcknowledged,

    /// A cancel request reached its target workflow
    Delivered,
}

/// Result of applying an event to an operation's state machine
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Transition {
    pub state: OperationState,
    pub effect: Effect,
}

impl Transition {
    pub fn to(state: OperationState) -> Self {
        Self {
            state,
            effect: Effect::None,
        }
    }

    pub fn with(state: OperationState, effect: Effect) -> Self {
        Self { state, effect }
    }
}

/// Interface shared by the per-kind state machines
///
/// `apply` returns `None` when the event is not valid in `state`; the caller
/// reports that as non-determinism.
pub(crate) trait StateMachine {
    fn apply(&mut self, state: OperationState, event: &EventAttributes) -> Option<Transition>;
}

/// One outstanding operation, tagged by kind
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Activity(ActivityOp),
    Timer(TimerOp),
    ChildWorkflow(ChildWorkflowOp),
    CancelRequest(CancelRequestOp),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Activity(_) => OperationKind::Activity,
            Self::Timer(_) => OperationKind::Timer,
            Self::ChildWorkflow(_) => OperationKind::ChildWorkflow,
            Self::CancelRequest(_) => OperationKind::CancelRequest,
        }
    }

    /// Policy applied when the owning scope is cancelled
    ///
    /// Timers are always cancelled eagerly. Cancel requests cannot
    /// themselves be cancelled.
    pub fn cancellation_type(&self) -> Option<CancellationType> {
        match self {
            Self::Activity(op) => Some(op.cancellation_type),
            Self::Timer(_) => Some(CancellationType::TryCancel),
            Self::ChildWorkflow(op) => Some(op.cancellation_type),
            Self::CancelRequest(_) => None,
        }
    }
}

impl StateMachine for Operation {
    fn apply(&mut self, state: OperationState, event: &EventAttributes) -> Option<Transition> {
        match self {
            Self::Activity(op) => op.apply(state, event),
            Self::Timer(op) => op.apply(state, event),
            Self::ChildWorkflow(op) => op.apply(state, event),
            Self::CancelRequest(op) => op.apply(state, event),
        }
    }
}
