//! Commands sent to the orchestration service

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::history::{EventAttributes, EventKind};
use crate::operation::OperationId;
use crate::serde_millis;
use crate::versioning::Marker;
use crate::workflow::{ActivityOptions, ChildWorkflowOptions, WorkflowError};

/// An outbound intent produced during a work unit
///
/// The service records every command it accepts as an echo event right
/// after the `WorkflowTaskCompleted` that closes the work unit; see
/// [`Command::echo`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Schedule an activity for execution
    ScheduleActivity {
        operation_id: OperationId,

        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts, etc.)
        options: ActivityOptions,
    },

    /// Ask the service to cancel a running activity
    RequestCancelActivity { operation_id: OperationId },

    /// Start a timer that fires after the specified duration
    StartTimer {
        operation_id: OperationId,

        #[serde(with = "serde_millis")]
        duration: Duration,
    },

    CancelTimer { operation_id: OperationId },

    /// Start a child workflow
    StartChildWorkflow {
        operation_id: OperationId,
        workflow_id: String,
        workflow_type: String,
        input: serde_json::Value,
        options: ChildWorkflowOptions,
    },

    /// Ask another workflow to cancel itself
    RequestCancelExternalWorkflow {
        operation_id: OperationId,
        workflow_id: String,

        /// Set when the target is this run's child
        child_operation: Option<OperationId>,
    },

    /// Record a deterministic decision
    RecordMarker { marker: Marker },

    /// Complete the workflow successfully with a result
    CompleteWorkflow { result: serde_json::Value },

    /// Fail the workflow with an error
    FailWorkflow { error: WorkflowError },

    /// Close the workflow as canceled
    CancelWorkflow { details: String },

    /// Close this run and start a new one with fresh history
    ContinueAsNew {
        workflow_type: String,
        input: serde_json::Value,
    },
}

impl Command {
    /// Operation this command acts on, if any
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            Self::ScheduleActivity { operation_id, .. }
            | Self::RequestCancelActivity { operation_id }
            | Self::StartTimer { operation_id, .. }
            | Self::CancelTimer { operation_id }
            | Self::StartChildWorkflow { operation_id, .. }
            | Self::RequestCancelExternalWorkflow { operation_id, .. } => Some(*operation_id),
            _ => None,
        }
    }

    /// Whether this command creates the operation it names
    pub fn initiates_operation(&self) -> bool {
        matches!(
            self,
            Self::ScheduleActivity { .. }
                | Self::StartTimer { .. }
                | Self::StartChildWorkflow { .. }
                | Self::RequestCancelExternalWorkflow { .. }
        )
    }

    /// Check if this command closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. }
                | Self::FailWorkflow { .. }
                | Self::CancelWorkflow { .. }
                | Self::ContinueAsNew { .. }
        )
    }

    /// Event kind the service records for this command
    pub fn echo_kind(&self) -> EventKind {
        self.echo().kind()
    }

    /// Event the service records when it accepts this command
    ///
    /// Replay compares historical echo events against this, so every field
    /// that identifies the command is carried here.
    pub fn echo(&self) -> EventAttributes {
        match self {
            Self::ScheduleActivity {
                operation_id,
                activity_id,
                activity_type,
                ..
            } => EventAttributes::ActivityTaskScheduled {
                operation_id: *operation_id,
                activity_id: activity_id.clone(),
                activity_type: activity_type.clone(),
            },
            Self::RequestCancelActivity { operation_id } => {
                EventAttributes::ActivityTaskCancelRequested {
                    operation_id: *operation_id,
                }
            }
            Self::StartTimer {
                operation_id,
                duration,
            } => EventAttributes::TimerStarted {
                operation_id: *operation_id,
                duration: *duration,
            },
            Self::CancelTimer { operation_id } => EventAttributes::TimerCanceled {
                operation_id: *operation_id,
            },
            Self::StartChildWorkflow {
                operation_id,
                workflow_id,
                workflow_type,
                ..
            } => EventAttributes::StartChildWorkflowExecutionInitiated {
                operation_id: *operation_id,
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
            },
            Self::RequestCancelExternalWorkflow {
                operation_id,
                workflow_id,
                ..
            } => EventAttributes::RequestCancelExternalWorkflowExecutionInitiated {
                operation_id: *operation_id,
                workflow_id: workflow_id.clone(),
            },
            Self::RecordMarker { marker } => EventAttributes::MarkerRecorded {
                marker: marker.clone(),
            },
            Self::CompleteWorkflow { result } => EventAttributes::WorkflowExecutionCompleted {
                result: result.clone(),
            },
            Self::FailWorkflow { error } => EventAttributes::WorkflowExecutionFailed {
                error: error.clone(),
            },
            Self::CancelWorkflow { details } => EventAttributes::WorkflowExecutionCanceled {
                details: details.clone(),
            },
            Self::ContinueAsNew {
                workflow_type,
                input,
            } => EventAttributes::WorkflowExecutionContinuedAsNew {
                workflow_type: workflow_type.clone(),
                input: input.clone(),
            },
        }
    }

    /// Whether a historical event is this command's echo
    pub fn matches_echo(&self, event: &EventAttributes) -> bool {
        self.echo() == *event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serialization() {
        let command = Command::StartTimer {
            operation_id: OperationId(2),
            duration: Duration::from_secs(30),
        };

        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "start_timer");
        assert_eq!(json["duration"], 30_000);

        let parsed: Command = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, command);
    }

    #[test]
    fn test_echo_mapping() {
        let command = Command::RequestCancelExternalWorkflow {
            operation_id: OperationId(3),
            workflow_id: "child-1".to_string(),
            child_operation: Some(OperationId(1)),
        };
        assert_eq!(
            command.echo_kind(),
            EventKind::RequestCancelExternalWorkflowExecutionInitiated
        );
        assert!(command.echo_kind().is_command_echo());

        let complete = Command::CompleteWorkflow { result: json!(1) };
        assert_eq!(complete.echo_kind(), EventKind::WorkflowExecutionCompleted);
        assert!(complete.is_terminal());
    }

    #[test]
    fn test_matches_echo_compares_identifying_fields() {
        let command = Command::ScheduleActivity {
            operation_id: OperationId(1),
            activity_id: "1".to_string(),
            activity_type: "charge".to_string(),
            input: json!({}),
            options: ActivityOptions::default(),
        };

        assert!(command.matches_echo(&EventAttributes::ActivityTaskScheduled {
            operation_id: OperationId(1),
            activity_id: "1".to_string(),
            activity_type: "charge".to_string(),
        }));
        assert!(!command.matches_echo(&EventAttributes::ActivityTaskScheduled {
            operation_id: OperationId(1),
            activity_id: "1".to_string(),
            activity_type: "refund".to_string(),
        }));
        assert!(!command.matches_echo(&EventAttributes::TimerStarted {
            operation_id: OperationId(1),
            duration: Duration::from_secs(1),
        }));
    }

    #[test]
    fn test_operation_classification() {
        let cancel = Command::CancelTimer {
            operation_id: OperationId(5),
        };
        assert_eq!(cancel.operation_id(), Some(OperationId(5)));
        assert!(!cancel.initiates_operation());

        let marker = Command::RecordMarker {
            marker: Marker::Version {
                change_id: "chg1".to_string(),
                version: 1,
            },
        };
        assert_eq!(marker.operation_id(), None);
        assert!(!marker.is_terminal());
    }
}
