//! Replay engine
//!
//! The [`ReplayEngine`] consumes a run's history in order, re-executes its
//! fibers deterministically, and emits the commands of the next work unit.

mod config;
mod error;
mod registry;
mod replay;
mod run;
mod scheduler;

pub use config::EngineConfig;
pub use error::{EngineError, NonDeterminismError, VersionRangeError};
pub use registry::{RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{replay_history, ReplayOutcome};
pub(crate) use run::RunCore;
pub use run::RunInfo;
pub use scheduler::{EngineSnapshot, OperationSummary, ReplayEngine};
