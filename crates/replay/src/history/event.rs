//! History events delivered by the orchestration service

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::OperationId;
use crate::serde_millis;
use crate::versioning::Marker;
use crate::workflow::WorkflowError;

/// Types of timeouts that can end an activity or child workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Activity was not picked up within schedule_to_start_timeout
    ScheduleToStart,

    /// Activity did not complete within start_to_close_timeout
    StartToClose,

    /// Whole operation did not complete within schedule_to_close_timeout
    ScheduleToClose,

    /// Worker did not send heartbeat within heartbeat_timeout
    Heartbeat,
}

/// Failure payload recorded by the service when an operation fails
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub failure_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl FailureInfo {
    /// Create a failure with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failure_type: None,
            details: None,
        }
    }

    /// Set the failure type
    pub fn with_type(mut self, failure_type: impl Into<String>) -> Self {
        self.failure_type = Some(failure_type.into());
        self
    }

    /// Add failure details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.failure_type {
            Some(t) => write!(f, "{}: {}", t, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// One immutable fact in a run's history
///
/// Events are produced and ordered exclusively by the orchestration service.
/// `sequence_id` starts at 1 and is gapless within a run; the engine
/// processes events in this order and only this order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Position of this event within the run's history
    pub sequence_id: u64,

    /// When the service recorded the event
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn new(sequence_id: u64, timestamp: DateTime<Utc>, attributes: EventAttributes) -> Self {
        Self {
            sequence_id,
            timestamp,
            attributes,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.attributes.kind()
    }

    pub fn operation_id(&self) -> Option<OperationId> {
        self.attributes.operation_id()
    }

    pub fn is_command_echo(&self) -> bool {
        self.kind().is_command_echo()
    }
}

/// Payload of a history event
///
/// Events that refer to an operation (activity, timer, child workflow,
/// cancel request) carry the engine-assigned [`OperationId`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventAttributes {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Run was started with the given input
    WorkflowExecutionStarted {
        /// Registered workflow type
        workflow_type: String,

        /// Business identifier of the workflow
        workflow_id: String,

        /// Identifier of this run
        run_id: Uuid,

        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// A client asked for the whole run to be cancelled
    WorkflowExecutionCancelRequested {
        /// Reason given by the requester
        reason: String,
    },

    /// The commands of a work unit follow this event
    WorkflowTaskCompleted,

    /// Run completed successfully
    WorkflowExecutionCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Run failed with an error
    WorkflowExecutionFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Run acknowledged its cancellation
    WorkflowExecutionCanceled {
        /// Cancellation details
        details: String,
    },

    /// Run was closed and a new run started with fresh history
    WorkflowExecutionContinuedAsNew {
        /// Workflow type of the new run
        workflow_type: String,

        /// Input of the new run
        input: serde_json::Value,
    },

    // =========================================================================
    // Marker Events
    // =========================================================================
    /// A deterministic decision was recorded
    MarkerRecorded {
        /// The recorded decision
        marker: Marker,
    },

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityTaskScheduled {
        operation_id: OperationId,

        /// Unique activity identifier within the run
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,
    },

    /// The service recorded the request to cancel an activity
    ActivityTaskCancelRequested { operation_id: OperationId },

    /// Activity completed successfully
    ActivityTaskCompleted {
        operation_id: OperationId,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// Activity failed after exhausting its retries
    ActivityTaskFailed {
        operation_id: OperationId,
        failure: FailureInfo,
    },

    /// Activity timed out
    ActivityTaskTimedOut {
        operation_id: OperationId,
        timeout_type: TimeoutType,
    },

    /// Activity acknowledged cancellation
    ActivityTaskCanceled { operation_id: OperationId },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started
    TimerStarted {
        operation_id: OperationId,

        /// How long until the timer fires
        #[serde(with = "serde_millis")]
        duration: Duration,
    },

    /// Timer fired (duration elapsed)
    TimerFired { operation_id: OperationId },

    /// Timer was cancelled
    TimerCanceled { operation_id: OperationId },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// The service accepted the request to start a child workflow
    StartChildWorkflowExecutionInitiated {
        operation_id: OperationId,
        workflow_id: String,
        workflow_type: String,
    },

    /// The child could not be started (e.g. id already in use)
    StartChildWorkflowExecutionFailed {
        operation_id: OperationId,
        cause: String,
    },

    /// Child workflow began running
    ChildWorkflowExecutionStarted {
        operation_id: OperationId,
        run_id: Uuid,
    },

    /// Child workflow completed successfully
    ChildWorkflowExecutionCompleted {
        operation_id: OperationId,
        result: serde_json::Value,
    },

    /// Child workflow failed
    ChildWorkflowExecutionFailed {
        operation_id: OperationId,
        failure: FailureInfo,
    },

    /// Child workflow timed out
    ChildWorkflowExecutionTimedOut { operation_id: OperationId },

    /// Child workflow acknowledged cancellation
    ChildWorkflowExecutionCanceled { operation_id: OperationId },

    /// Child workflow was terminated by an operator
    ChildWorkflowExecutionTerminated { operation_id: OperationId },

    // =========================================================================
    // External Cancellation Events
    // =========================================================================
    /// The service accepted the request to cancel another workflow
    RequestCancelExternalWorkflowExecutionInitiated {
        operation_id: OperationId,
        workflow_id: String,
    },

    /// The cancel request could not be delivered
    RequestCancelExternalWorkflowExecutionFailed {
        operation_id: OperationId,
        cause: String,
    },

    /// The target workflow received the cancel request
    ExternalWorkflowExecutionCancelRequested { operation_id: OperationId },
}

impl EventAttributes {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowExecutionStarted { .. } => EventKind::WorkflowExecutionStarted,
            Self::WorkflowExecutionCancelRequested { .. } => {
                EventKind::WorkflowExecutionCancelRequested
            }
            Self::WorkflowTaskCompleted => EventKind::WorkflowTaskCompleted,
            Self::WorkflowExecutionCompleted { .. } => EventKind::WorkflowExecutionCompleted,
            Self::WorkflowExecutionFailed { .. } => EventKind::WorkflowExecutionFailed,
            Self::WorkflowExecutionCanceled { .. } => EventKind::WorkflowExecutionCanceled,
            Self::WorkflowExecutionContinuedAsNew { .. } => {
                EventKind::WorkflowExecutionContinuedAsNew
            }
            Self::MarkerRecorded { .. } => EventKind::MarkerRecorded,
            Self::ActivityTaskScheduled { .. } => EventKind::ActivityTaskScheduled,
            Self::ActivityTaskCancelRequested { .. } => EventKind::ActivityTaskCancelRequested,
            Self::ActivityTaskCompleted { .. } => EventKind::ActivityTaskCompleted,
            Self::ActivityTaskFailed { .. } => EventKind::ActivityTaskFailed,
            Self::ActivityTaskTimedOut { .. } => EventKind::ActivityTaskTimedOut,
            Self::ActivityTaskCanceled { .. } => EventKind::ActivityTaskCanceled,
            Self::TimerStarted { .. } => EventKind::TimerStarted,
            Self::TimerFired { .. } => EventKind::TimerFired,
            Self::TimerCanceled { .. } => EventKind::TimerCanceled,
            Self::StartChildWorkflowExecutionInitiated { .. } => {
                EventKind::StartChildWorkflowExecutionInitiated
            }
            Self::StartChildWorkflowExecutionFailed { .. } => {
                EventKind::StartChildWorkflowExecutionFailed
            }
            Self::ChildWorkflowExecutionStarted { .. } => EventKind::ChildWorkflowExecutionStarted,
            Self::ChildWorkflowExecutionCompleted { .. } => {
                EventKind::ChildWorkflowExecutionCompleted
            }
            Self::ChildWorkflowExecutionFailed { .. } => EventKind::ChildWorkflowExecutionFailed,
            Self::ChildWorkflowExecutionTimedOut { .. } => {
                EventKind::ChildWorkflowExecutionTimedOut
            }
            Self::ChildWorkflowExecutionCanceled { .. } => {
                EventKind::ChildWorkflowExecutionCanceled
            }
            Self::ChildWorkflowExecutionTerminated { .. } => {
                EventKind::ChildWorkflowExecutionTerminated
            }
            Self::RequestCancelExternalWorkflowExecutionInitiated { .. } => {
                EventKind::RequestCancelExternalWorkflowExecutionInitiated
            }
            Self::RequestCancelExternalWorkflowExecutionFailed { .. } => {
                EventKind::RequestCancelExternalWorkflowExecutionFailed
            }
            Self::ExternalWorkflowExecutionCancelRequested { .. } => {
                EventKind::ExternalWorkflowExecutionCancelRequested
            }
        }
    }

    /// Get the operation this event targets, if any
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            Self::ActivityTaskScheduled { operation_id, .. }
            | Self::ActivityTaskCancelRequested { operation_id }
            | Self::ActivityTaskCompleted { operation_id, .. }
            | Self::ActivityTaskFailed { operation_id, .. }
            | Self::ActivityTaskTimedOut { operation_id, .. }
            | Self::ActivityTaskCanceled { operation_id }
            | Self::TimerStarted { operation_id, .. }
            | Self::TimerFired { operation_id }
            | Self::TimerCanceled { operation_id }
            | Self::StartChildWorkflowExecutionInitiated { operation_id, .. }
            | Self::StartChildWorkflowExecutionFailed { operation_id, .. }
            | Self::ChildWorkflowExecutionStarted { operation_id, .. }
            | Self::ChildWorkflowExecutionCompleted { operation_id, .. }
            | Self::ChildWorkflowExecutionFailed { operation_id, .. }
            | Self::ChildWorkflowExecutionTimedOut { operation_id }
            | Self::ChildWorkflowExecutionCanceled { operation_id }
            | Self::ChildWorkflowExecutionTerminated { operation_id }
            | Self::RequestCancelExternalWorkflowExecutionInitiated { operation_id, .. }
            | Self::RequestCancelExternalWorkflowExecutionFailed { operation_id, .. }
            | Self::ExternalWorkflowExecutionCancelRequested { operation_id } => {
                Some(*operation_id)
            }
            _ => None,
        }
    }
}

/// Closed set of history event types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowExecutionStarted,
    WorkflowExecutionCancelRequested,
    WorkflowTaskCompleted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionContinuedAsNew,
    MarkerRecorded,
    ActivityTaskScheduled,
    ActivityTaskCancelRequested,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    StartChildWorkflowExecutionInitiated,
    StartChildWorkflowExecutionFailed,
    ChildWorkflowExecutionStarted,
    ChildWorkflowExecutionCompleted,
    ChildWorkflowExecutionFailed,
    ChildWorkflowExecutionTimedOut,
    ChildWorkflowExecutionCanceled,
    ChildWorkflowExecutionTerminated,
    RequestCancelExternalWorkflowExecutionInitiated,
    RequestCancelExternalWorkflowExecutionFailed,
    ExternalWorkflowExecutionCancelRequested,
}

impl EventKind {
    /// Whether this event is the service's record of a command the engine sent
    ///
    /// Echo events must line up one-for-one with the commands produced by
    /// the work unit that precedes them.
    pub fn is_command_echo(&self) -> bool {
        matches!(
            self,
            Self::ActivityTaskScheduled
                | Self::ActivityTaskCancelRequested
                | Self::TimerStarted
                | Self::TimerCanceled
                | Self::StartChildWorkflowExecutionInitiated
                | Self::RequestCancelExternalWorkflowExecutionInitiated
                | Self::MarkerRecorded
                | Self::WorkflowExecutionCompleted
                | Self::WorkflowExecutionFailed
                | Self::WorkflowExecutionCanceled
                | Self::WorkflowExecutionContinuedAsNew
        )
    }

    /// Check if this event closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionCompleted
                | Self::WorkflowExecutionFailed
                | Self::WorkflowExecutionCanceled
                | Self::WorkflowExecutionContinuedAsNew
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
