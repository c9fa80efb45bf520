//! One-shot replay of a complete history

use std::sync::Arc;

use tracing::info;

use super::{EngineConfig, EngineError, EngineSnapshot, ReplayEngine, WorkflowRegistry};
use crate::command::Command;
use crate::history::HistoryEvent;

/// Result of replaying a history from its first event
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    /// Commands of the live round that follows the last recorded work unit
    pub commands: Vec<Command>,

    pub snapshot: EngineSnapshot,
}

/// Rebuild a run's state from its full history
///
/// Every recorded work unit is re-executed and checked against the
/// commands it recorded. Useful for recovering a run on a new worker and
/// for verifying that changed workflow code still replays old histories.
pub fn replay_history(
    registry: Arc<WorkflowRegistry>,
    history: &[HistoryEvent],
    config: EngineConfig,
) -> Result<ReplayOutcome, EngineError> {
    let mut engine = ReplayEngine::new(registry, config);
    let mut commands = engine.advance(history)?;
    commands.extend(engine.settle()?);

    info!(
        events = history.len(),
        commands = commands.len(),
        "history replayed"
    );

    Ok(ReplayOutcome {
        commands,
        snapshot: engine.snapshot(),
    })
}
