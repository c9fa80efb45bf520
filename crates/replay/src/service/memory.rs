//! In-memory orchestration service for tests and local runs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{CommandSink, HistoryFeed, ServiceError};
use crate::command::Command;
use crate::history::{EventAttributes, HistoryEvent};
use crate::operation::OperationId;

/// Internal run state
struct RunState {
    events: Vec<HistoryEvent>,

    /// A poll returned events and its work unit is not completed yet
    outstanding: bool,

    /// External events held back until the outstanding unit completes
    buffered: Vec<EventAttributes>,

    closed: bool,
}

impl RunState {
    fn append(&mut self, attributes: EventAttributes) {
        let sequence_id = self.events.len() as u64 + 1;
        if attributes.kind().is_terminal() {
            self.closed = true;
        }
        self.events
            .push(HistoryEvent::new(sequence_id, Utc::now(), attributes));
    }

    /// Close the outstanding unit and record what arrived meanwhile
    fn finish_unit(&mut self) {
        self.outstanding = false;
        let buffered = std::mem::take(&mut self.buffered);
        if !self.closed {
            for attributes in buffered {
                self.append(attributes);
            }
        }
    }
}

/// In-memory implementation of [`HistoryFeed`] and [`CommandSink`]
///
/// Records echoes for completed work units the way a real service would,
/// and keeps events injected during an outstanding work unit until that
/// unit's echoes are recorded.
///
/// # Example
///
/// ```
/// use everruns_replay::InMemoryHistoryService;
///
/// let service = InMemoryHistoryService::new();
/// let run_id = service.start_workflow("greet", "greet-1", serde_json::json!("Ada"));
/// assert_eq!(service.history(run_id).len(), 1);
/// ```
pub struct InMemoryHistoryService {
    runs: RwLock<HashMap<Uuid, RunState>>,
}

impl InMemoryHistoryService {
    /// Create a new in-memory service
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Record a new run and return its run id
    pub fn start_workflow(
        &self,
        workflow_type: impl Into<String>,
        workflow_id: impl Into<String>,
        input: Value,
    ) -> Uuid {
        let run_id = Uuid::now_v7();
        let mut run = RunState {
            events: Vec::new(),
            outstanding: false,
            buffered: Vec::new(),
            closed: false,
        };
        run.append(EventAttributes::WorkflowExecutionStarted {
            workflow_type: workflow_type.into(),
            workflow_id: workflow_id.into(),
            run_id,
            input,
        });

        self.runs.write().insert(run_id, run);
        debug!(%run_id, "run started");
        run_id
    }

    /// Record an event produced outside the workflow
    pub fn record_event(
        &self,
        run_id: Uuid,
        attributes: EventAttributes,
    ) -> Result<(), ServiceError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(ServiceError::RunNotFound(run_id))?;
        if run.closed {
            return Err(ServiceError::RunClosed(run_id));
        }

        if run.outstanding {
            debug!(%run_id, kind = %attributes.kind(), "event buffered until work unit completes");
            run.buffered.push(attributes);
        } else {
            run.append(attributes);
        }
        Ok(())
    }

    pub fn request_cancellation(
        &self,
        run_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), ServiceError> {
        self.record_event(
            run_id,
            EventAttributes::WorkflowExecutionCancelRequested {
                reason: reason.into(),
            },
        )
    }

    pub fn complete_activity(
        &self,
        run_id: Uuid,
        operation_id: OperationId,
        result: Value,
    ) -> Result<(), ServiceError> {
        self.record_event(
            run_id,
            EventAttributes::ActivityTaskCompleted {
                operation_id,
                result,
            },
        )
    }

    pub fn fire_timer(&self, run_id: Uuid, operation_id: OperationId) -> Result<(), ServiceError> {
        self.record_event(run_id, EventAttributes::TimerFired { operation_id })
    }

    /// Full history of a run; empty for unknown runs
    pub fn history(&self, run_id: Uuid) -> Vec<HistoryEvent> {
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.events.clone())
            .unwrap_or_default()
    }

    /// Whether the run recorded its terminal event
    pub fn is_closed(&self, run_id: Uuid) -> bool {
        self.runs.read().get(&run_id).map(|r| r.closed).unwrap_or(false)
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }
}

impl Default for InMemoryHistoryService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryFeed for InMemoryHistoryService {
    async fn poll_history(
        &self,
        run_id: Uuid,
        after_sequence_id: u64,
    ) -> Result<Vec<HistoryEvent>, ServiceError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(ServiceError::RunNotFound(run_id))?;

        let events: Vec<HistoryEvent> = run
            .events
            .iter()
            .filter(|e| e.sequence_id > after_sequence_id)
            .cloned()
            .collect();

        if !events.is_empty() && !run.closed {
            run.outstanding = true;
        }
        Ok(events)
    }

    async fn fetch_full_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, ServiceError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.events.clone())
            .ok_or(ServiceError::RunNotFound(run_id))
    }
}

#[async_trait]
impl CommandSink for InMemoryHistoryService {
    async fn complete_work_unit(
        &self,
        run_id: Uuid,
        commands: Vec<Command>,
    ) -> Result<(), ServiceError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(ServiceError::RunNotFound(run_id))?;
        if run.closed {
            return Err(ServiceError::RunClosed(run_id));
        }
        if !run.outstanding {
            return Err(ServiceError::NoOutstandingWorkUnit(run_id));
        }

        run.append(EventAttributes::WorkflowTaskCompleted);
        for command in &commands {
            run.append(command.echo());
        }
        run.finish_unit();

        debug!(%run_id, commands = commands.len(), closed = run.closed, "work unit completed");
        Ok(())
    }

    async fn release_work_unit(&self, run_id: Uuid) -> Result<(), ServiceError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(ServiceError::RunNotFound(run_id))?;
        if !run.outstanding {
            return Err(ServiceError::NoOutstandingWorkUnit(run_id));
        }

        run.finish_unit();
        debug!(%run_id, "work unit released");
        Ok(())
    }
}
