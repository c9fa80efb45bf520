//! Traits at the boundary between the engine and the orchestration service

use async_trait::async_trait;
use uuid::Uuid;

use crate::command::Command;
use crate::history::HistoryEvent;

/// Error type for service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Run already recorded its terminal event
    #[error("run already closed: {0}")]
    RunClosed(Uuid),

    /// Commands submitted without a polled work unit
    #[error("no work unit is outstanding for run {0}")]
    NoOutstandingWorkUnit(Uuid),

    /// Backend failure
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Source of a run's ordered history
#[async_trait]
pub trait HistoryFeed: Send + Sync {
    /// Events recorded after `after_sequence_id`, in order
    ///
    /// A non-empty answer opens a work unit that the caller must close with
    /// [`CommandSink::complete_work_unit`].
    async fn poll_history(
        &self,
        run_id: Uuid,
        after_sequence_id: u64,
    ) -> Result<Vec<HistoryEvent>, ServiceError>;

    /// The entire history of a run, for replay from scratch
    async fn fetch_full_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, ServiceError>;
}

/// Receiver of the commands a work unit produced
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Close the outstanding work unit
    ///
    /// The service records `WorkflowTaskCompleted` followed by one echo event
    /// per command, in order.
    async fn complete_work_unit(
        &self,
        run_id: Uuid,
        commands: Vec<Command>,
    ) -> Result<(), ServiceError>;

    /// Close the outstanding work unit without recording anything
    ///
    /// Used when the polled events left the workflow with nothing to do.
    async fn release_work_unit(&self, run_id: Uuid) -> Result<(), ServiceError>;
}
