//! # Deterministic Replay Engine
//!
//! Client-side execution core for durable workflows. Workflow code runs as
//! cooperative fibers that are re-executed against the run's event history;
//! the engine turns each new slice of history into the commands of the next
//! work unit, and detects when the code no longer reproduces the history.
//!
//! ## Features
//!
//! - **Deterministic scheduling**: fibers resume in creation order, one pass
//!   at a time, until nothing changes
//! - **Cancellation scopes**: a tree of scopes with per-operation
//!   cancellation policies (`WAIT_CANCELLATION_REQUESTED`,
//!   `WAIT_CANCELLATION_COMPLETED`, `TRY_CANCEL`, `ABANDON`)
//! - **Operation state machines**: activities, timers, child workflows and
//!   external cancel requests driven by history events
//! - **Versioning markers**: `get_version` lets code evolve without
//!   breaking replay of runs started by older code
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         RunDriver                            │
//! │   (polls history, submits commands, restarts from scratch)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ReplayEngine                           │
//! │  (applies events, matches echoes, runs scheduler rounds)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │    ScopeTree · OperationTable · VersionTable · Commands      │
//! │          (reached by fibers through WorkflowContext)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use everruns_replay::prelude::*;
//!
//! struct Greet {
//!     name: String,
//!     activity: Option<OperationId>,
//! }
//!
//! impl Workflow for Greet {
//!     const TYPE: &'static str = "greet";
//!     type Input = String;
//!
//!     fn new(name: String) -> Self {
//!         Self { name, activity: None }
//!     }
//! }
//!
//! impl Fiber for Greet {
//!     fn resume(
//!         &mut self,
//!         ctx: &mut WorkflowContext<'_>,
//!         wakeup: Wakeup,
//!     ) -> Result<FiberStep, EngineError> {
//!         if self.activity.is_none() {
//!             let id = ctx.schedule_activity("say_hello", &self.name, ActivityOptions::default())?;
//!             self.activity = Some(id);
//!             return Ok(FiberStep::await_operation(id));
//!         }
//!         Ok(FiberStep::from_result(wakeup.into_result()))
//!     }
//! }
//! ```

pub mod command;
pub mod engine;
pub mod history;
pub mod operation;
pub mod scope;
pub mod service;
pub mod versioning;
pub mod workflow;

mod serde_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::command::Command;
    pub use crate::engine::{
        replay_history, EngineConfig, EngineError, ReplayEngine, WorkflowRegistry,
    };
    pub use crate::history::{EventAttributes, HistoryEvent};
    pub use crate::operation::OperationId;
    pub use crate::scope::ScopeId;
    pub use crate::service::{CommandSink, HistoryFeed, InMemoryHistoryService, RunDriver};
    pub use crate::versioning::DEFAULT_VERSION;
    pub use crate::workflow::{
        fiber_fn, ActivityOptions, CancellationType, ChildWorkflowOptions, Fiber, FiberId,
        FiberStep, Resolution, Wakeup, Workflow, WorkflowContext, WorkflowError,
    };
}

// Re-export key types at crate root
pub use command::Command;
pub use engine::{
    replay_history, EngineConfig, EngineError, EngineSnapshot, NonDeterminismError,
    ReplayEngine, ReplayOutcome, RunInfo, VersionRangeError, WorkflowRegistry,
};
pub use history::{EventAttributes, EventKind, FailureInfo, HistoryEvent};
pub use operation::{OperationId, OperationState};
pub use scope::ScopeId;
pub use service::{
    CommandSink, DriverError, HistoryFeed, InMemoryHistoryService, RunDriver, ServiceError,
};
pub use versioning::{Marker, DEFAULT_VERSION};
pub use workflow::{
    fiber_fn, ActivityOptions, CancellationType, ChildWorkflowOptions, Fiber, FiberId, FiberStep,
    Resolution, Wakeup, Workflow, WorkflowContext, WorkflowError,
};
