//! Replay engine: applies history, runs fibers, and emits commands
//!
//! History is consumed in batches. Each `WorkflowTaskCompleted` event marks
//! the end of a work unit and is followed by the echoes of the commands that
//! unit produced. The engine replays a unit by re-running the scheduler once
//! all of the unit's echoes are known, and checking that the commands it
//! produces match those echoes, in order. Batches may split a unit anywhere.
//! Events after the last boundary drive one live round whose commands are
//! returned to the caller.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::run::{RunCore, RunInfo};
use super::{EngineConfig, EngineError, NonDeterminismError, WorkflowRegistry};
use crate::command::{Command, EchoMatch};
use crate::history::{EventAttributes, HistoryEvent};
use crate::operation::{OperationId, OperationKind, OperationState, TableError};
use crate::scope::{ScopeId, ScopeRecord};
use crate::versioning::{Marker, VersionTable};
use crate::workflow::{
    Fiber, FiberId, FiberState, FiberStatus, FiberStep, Wakeup, WorkflowContext, WorkflowError,
};

/// Deterministic executor for one workflow run
pub struct ReplayEngine {
    registry: Arc<WorkflowRegistry>,
    config: EngineConfig,
    core: Option<RunCore>,

    /// Fiber bodies indexed like `RunCore::fibers`; dropped once finished
    bodies: Vec<Option<Box<dyn Fiber>>>,

    last_sequence_id: u64,

    /// Live rounds whose `WorkflowTaskCompleted` has not been seen yet
    unacknowledged_units: u32,

    live_rounds: u64,

    /// Echoes of a replayed unit whose round has not run yet
    deferred_unit: Option<Vec<HistoryEvent>>,

    /// The terminal command's echo has been applied
    closed: bool,

    fatal: Option<String>,
}

/// Point-in-time view of a run's engine state
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineSnapshot {
    pub run: Option<RunInfo>,
    pub last_sequence_id: u64,
    pub versions: VersionTable,
    pub scopes: Vec<ScopeRecord>,
    pub operations: Vec<OperationSummary>,
    pub fibers: Vec<FiberStatus>,
    pub pending_echoes: usize,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OperationSummary {
    pub id: OperationId,
    pub kind: OperationKind,
    pub state: OperationState,
    pub scope: ScopeId,
}

impl ReplayEngine {
    pub fn new(registry: Arc<WorkflowRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            core: None,
            bodies: Vec::new(),
            last_sequence_id: 0,
            unacknowledged_units: 0,
            live_rounds: 0,
            deferred_unit: None,
            closed: false,
            fatal: None,
        }
    }

    /// Apply new history events and return the commands of the next work unit
    ///
    /// Events must continue the sequence where the previous batch ended.
    /// If the batch leaves a fiber ready to run, it ends with one live
    /// round (see [`ReplayEngine::live_rounds`]); every such round must be
    /// closed by the service with a `WorkflowTaskCompleted` followed by the
    /// echoes of the returned commands.
    ///
    /// A batch may end anywhere, including inside a recorded work unit. That
    /// unit is replayed once a later event shows all of its echoes are in,
    /// or when [`ReplayEngine::settle`] declares the history complete. Any
    /// error is fatal: the engine refuses further batches.
    #[instrument(skip(self, events), fields(run_id = ?self.run_id(), events = events.len()))]
    pub fn advance(&mut self, events: &[HistoryEvent]) -> Result<Vec<Command>, EngineError> {
        self.guarded(|engine| engine.advance_batch(events))
    }

    /// Treat the history applied so far as complete
    ///
    /// Replays a recorded unit still waiting for echoes, then runs the live
    /// round that follows if there is work for it. Callers whose batches
    /// always end on a unit boundary call this after every `advance`.
    #[instrument(skip(self), fields(run_id = ?self.run_id()))]
    pub fn settle(&mut self) -> Result<Vec<Command>, EngineError> {
        self.guarded(|engine| {
            let sequence_id = engine.last_sequence_id;
            engine.replay_deferred_unit().map_err(|e| e.at(sequence_id))?;
            engine.live_round()
        })
    }

    fn guarded(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<Vec<Command>, EngineError>,
    ) -> Result<Vec<Command>, EngineError> {
        if let Some(message) = &self.fatal {
            return Err(EngineError::Poisoned(message.clone()));
        }

        match step(self) {
            Ok(commands) => {
                debug!(commands = commands.len(), "batch applied");
                Ok(commands)
            }
            Err(e) => {
                error!(error = %e, "replay failed");
                self.fatal = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn advance_batch(&mut self, events: &[HistoryEvent]) -> Result<Vec<Command>, EngineError> {
        for event in events {
            self.apply_event(event).map_err(|e| e.at(event.sequence_id))?;
        }

        // More echoes of the replayed unit may follow in the next batch
        if self.deferred_unit.is_some() {
            return Ok(Vec::new());
        }
        self.live_round()
    }

    fn live_round(&mut self) -> Result<Vec<Command>, EngineError> {
        let Some(core) = &self.core else {
            return Ok(Vec::new());
        };
        if self.closed || core.closing || !core.has_pending_work() {
            return Ok(Vec::new());
        }

        let commands = self.run_round(false)?;
        self.unacknowledged_units += 1;
        self.live_rounds += 1;
        Ok(commands)
    }

    // =========================================================================
    // Event application
    // =========================================================================

    fn apply_event(&mut self, event: &HistoryEvent) -> Result<(), EngineError> {
        let expected = self.last_sequence_id + 1;
        if event.sequence_id != expected {
            return Err(EngineError::invalid_history(format!(
                "expected event {} but got {}",
                expected, event.sequence_id
            )));
        }
        if self.closed {
            return Err(EngineError::invalid_history(format!(
                "{} recorded after the run closed",
                event.kind()
            )));
        }
        if event.sequence_id as usize > self.config.max_history_events {
            return Err(EngineError::LimitExceeded(format!(
                "history is longer than {} events",
                self.config.max_history_events
            )));
        }
        self.last_sequence_id = event.sequence_id;

        if let EventAttributes::WorkflowExecutionStarted {
            workflow_type,
            workflow_id,
            run_id,
            input,
        } = &event.attributes
        {
            let run = RunInfo {
                workflow_type: workflow_type.clone(),
                workflow_id: workflow_id.clone(),
                run_id: *run_id,
                input: input.clone(),
                started_at: event.timestamp,
            };
            return self.start(run);
        }

        if self.core.is_none() {
            return Err(EngineError::invalid_history(format!(
                "history starts with {} instead of WorkflowExecutionStarted",
                event.kind()
            )));
        }

        if matches!(event.attributes, EventAttributes::WorkflowTaskCompleted) {
            self.replay_deferred_unit()?;
            return self.complete_work_unit();
        }
        if let Some(echoes) = self.deferred_unit.as_mut() {
            if event.is_command_echo() {
                echoes.push(event.clone());
                // Nothing follows the run's terminal echo
                if event.kind().is_terminal() {
                    self.replay_deferred_unit()?;
                }
                return Ok(());
            }
            self.replay_deferred_unit()?;
        }

        let Some(core) = self.core.as_mut() else {
            return Ok(());
        };
        if self.unacknowledged_units > 0 {
            return Err(EngineError::invalid_history(format!(
                "{} recorded before the outstanding work unit was completed",
                event.kind()
            )));
        }

        core.now = event.timestamp;
        if event.is_command_echo() {
            Self::apply_echo(core, &mut self.closed, event)
        } else {
            Self::apply_external(core, event)
        }
    }

    fn start(&mut self, run: RunInfo) -> Result<(), EngineError> {
        if self.core.is_some() {
            return Err(EngineError::invalid_history("run started twice"));
        }

        let root = self.registry.create(&run.workflow_type, run.input.clone())?;
        info!(
            workflow_type = %run.workflow_type,
            workflow_id = %run.workflow_id,
            "starting run"
        );

        let mut core = RunCore::new(run, self.config.max_fibers);
        core.add_fiber(ScopeId::ROOT, Vec::new(), root)?;
        self.bodies.extend(core.spawned.drain(..).map(Some));
        self.core = Some(core);
        Ok(())
    }

    /// Handle a `WorkflowTaskCompleted` boundary
    ///
    /// Boundaries of units this engine ran live only acknowledge them. Any
    /// other boundary starts a replayed unit, whose round waits until the
    /// unit's echoes have been collected.
    fn complete_work_unit(&mut self) -> Result<(), EngineError> {
        if self.unacknowledged_units > 0 {
            self.unacknowledged_units -= 1;
            return Ok(());
        }

        let Some(core) = self.core.as_ref() else {
            return Ok(());
        };
        if let Some(command) = core.commands.next_expected() {
            return Err(NonDeterminismError::new(format!(
                "workflow produced {:?} which history does not record",
                command
            ))
            .into());
        }

        self.deferred_unit = Some(Vec::new());
        Ok(())
    }

    /// Run a replayed unit's round and check it against the unit's echoes
    ///
    /// The scheduler runs as it did originally, with recorded markers made
    /// available to `get_version` and `side_effect` first.
    fn replay_deferred_unit(&mut self) -> Result<(), EngineError> {
        let Some(echoes) = self.deferred_unit.take() else {
            return Ok(());
        };
        let Some(core) = self.core.as_mut() else {
            return Ok(());
        };

        for event in &echoes {
            if let EventAttributes::MarkerRecorded { marker } = &event.attributes {
                match marker {
                    Marker::Version {
                        change_id,
                        version,
                    } => core.versions.preload(change_id, *version)?,
                    Marker::SideEffect {
                        side_effect_id,
                        value,
                    } => core.side_effects.preload(*side_effect_id, value.clone()),
                }
            }
        }

        self.run_round(true)?;

        for event in &echoes {
            let Some(core) = self.core.as_mut() else {
                break;
            };
            core.now = event.timestamp;
            Self::apply_echo(core, &mut self.closed, event).map_err(|e| e.at(event.sequence_id))?;
        }
        Ok(())
    }

    fn apply_echo(
        core: &mut RunCore,
        closed: &mut bool,
        event: &HistoryEvent,
    ) -> Result<(), EngineError> {
        match core.commands.match_echo(&event.attributes) {
            EchoMatch::Matched(command) => {
                if command.is_terminal() {
                    *closed = true;
                    info!(kind = %event.kind(), "run closed");
                    return Ok(());
                }
                let Some(id) = command.operation_id() else {
                    return Ok(());
                };
                if core.operations.get(id).is_none() {
                    return Ok(());
                }
                let outcome = core
                    .operations
                    .apply_event(id, &event.attributes)
                    .map_err(table_error)?;
                core.apply_event_outcome(id, outcome);
                Ok(())
            }
            EchoMatch::Mismatch { expected } => {
                // Version markers may outlive the code that recorded them
                if let EventAttributes::MarkerRecorded {
                    marker: Marker::Version { change_id, version },
                } = &event.attributes
                {
                    warn!(change_id, version, "recorded version has no matching call");
                    core.versions.observe_recorded(change_id, *version)?;
                    return Ok(());
                }

                let message = match expected {
                    Some(command) => format!(
                        "history records {} but the workflow produced {:?}",
                        event.kind(),
                        command
                    ),
                    None => format!(
                        "history records {} but the workflow produced no matching command",
                        event.kind()
                    ),
                };
                Err(NonDeterminismError::new(message).into())
            }
        }
    }

    fn apply_external(core: &mut RunCore, event: &HistoryEvent) -> Result<(), EngineError> {
        if let Some(command) = core.commands.next_expected() {
            return Err(NonDeterminismError::new(format!(
                "workflow produced {:?} but history records {} in its place",
                command,
                event.kind()
            ))
            .into());
        }

        if let EventAttributes::WorkflowExecutionCancelRequested { reason } = &event.attributes {
            info!(reason = %reason, "cancellation requested");
            core.request_cancel(ScopeId::ROOT, reason);
            return Ok(());
        }

        let Some(id) = event.operation_id() else {
            return Err(EngineError::invalid_history(format!(
                "unexpected {} event",
                event.kind()
            )));
        };

        if core.operations.get(id).is_none() && core.operations.was_issued(id) {
            return Err(EngineError::invalid_history(format!(
                "{} refers to {} which already finished",
                event.kind(),
                id
            )));
        }

        let outcome = core
            .operations
            .apply_event(id, &event.attributes)
            .map_err(table_error)?;
        core.apply_event_outcome(id, outcome);
        Ok(())
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Run fibers until no pass changes anything, then close the work unit
    fn run_round(&mut self, replaying: bool) -> Result<Vec<Command>, EngineError> {
        let max_passes = self.config.max_scheduler_passes;
        let max_steps = self.config.max_steps_per_fiber_visit;
        let Some(core) = self.core.as_mut() else {
            return Ok(Vec::new());
        };
        core.replaying = replaying;

        let mut passes = 0;
        while !core.closing {
            passes += 1;
            if passes > max_passes {
                return Err(EngineError::Livelock(max_passes));
            }

            let before = core.progress;
            let mut index = 0;
            // Fibers spawned during the pass are visited in the same pass
            while index < core.fibers.len() && !core.closing {
                visit(core, &mut self.bodies, FiberId(index), max_steps)?;
                index += 1;
            }
            if core.progress == before {
                break;
            }
        }

        let commands = core.commands.flush();
        debug!(replaying, passes, commands = commands.len(), "round finished");
        Ok(commands)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn run_id(&self) -> Option<Uuid> {
        self.core.as_ref().map(|c| c.run.run_id)
    }

    pub fn run_info(&self) -> Option<&RunInfo> {
        self.core.as_ref().map(|c| &c.run)
    }

    /// The last sequence id applied
    pub fn last_sequence_id(&self) -> u64 {
        self.last_sequence_id
    }

    /// Live rounds whose `WorkflowTaskCompleted` is not in history yet
    pub fn outstanding_units(&self) -> u32 {
        self.unacknowledged_units
    }

    /// Live rounds run so far
    ///
    /// The service records a work unit whenever this grows, even when the
    /// round produced no commands.
    pub fn live_rounds(&self) -> u64 {
        self.live_rounds
    }

    /// A terminal command has been produced
    pub fn is_closing(&self) -> bool {
        self.core.as_ref().map(|c| c.closing).unwrap_or(false)
    }

    /// The run's terminal event is in history
    pub fn is_finished(&self) -> bool {
        self.closed
    }

    pub fn is_poisoned(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn versions(&self) -> Option<&VersionTable> {
        self.core.as_ref().map(|c| &c.versions)
    }

    pub fn fiber_status(&self, id: FiberId) -> Option<FiberStatus> {
        self.core
            .as_ref()
            .and_then(|c| c.fibers.get(id.index()))
            .map(|f| f.state.status())
    }

    pub fn operation_state(&self, id: OperationId) -> Option<OperationState> {
        self.core
            .as_ref()
            .and_then(|c| c.operations.get(id))
            .map(|r| r.state)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let Some(core) = &self.core else {
            return EngineSnapshot {
                run: None,
                last_sequence_id: self.last_sequence_id,
                versions: VersionTable::new(),
                scopes: Vec::new(),
                operations: Vec::new(),
                fibers: Vec::new(),
                pending_echoes: 0,
                closed: self.closed,
            };
        };

        EngineSnapshot {
            run: Some(core.run.clone()),
            last_sequence_id: self.last_sequence_id,
            versions: core.versions.clone(),
            scopes: core.scopes.iter().cloned().collect(),
            operations: core
                .operations
                .iter()
                .map(|r| OperationSummary {
                    id: r.id,
                    kind: r.kind(),
                    state: r.state,
                    scope: r.scope,
                })
                .collect(),
            fibers: core.fibers.iter().map(|f| f.state.status()).collect(),
            pending_echoes: core.commands.pending_echoes(),
            closed: self.closed,
        }
    }
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("run_id", &self.run_id())
            .field("last_sequence_id", &self.last_sequence_id)
            .field("fibers", &self.bodies.len())
            .field("closed", &self.closed)
            .field("fatal", &self.fatal)
            .finish()
    }
}

/// Resume one fiber until it blocks, yields, or finishes
fn visit(
    core: &mut RunCore,
    bodies: &mut Vec<Option<Box<dyn Fiber>>>,
    id: FiberId,
    max_steps: usize,
) -> Result<(), EngineError> {
    let index = id.index();
    let mut steps = 0;

    loop {
        let wakeup = match &core.fibers[index].state {
            FiberState::Runnable(wakeup) => wakeup.clone(),
            _ => return Ok(()),
        };
        let Some(body) = bodies.get_mut(index).and_then(Option::as_mut) else {
            return Ok(());
        };

        steps += 1;
        if steps > max_steps {
            return Err(EngineError::LimitExceeded(format!(
                "{} took {} steps without blocking",
                id, max_steps
            )));
        }

        let step = {
            let mut ctx = WorkflowContext::new(core, id);
            body.resume(&mut ctx, wakeup)?
        };
        bodies.extend(core.spawned.drain(..).map(Some));

        match step {
            FiberStep::Await(awaiting) => match core.await_on(id, awaiting)? {
                Some(resolution) => {
                    core.fibers[index].state = FiberState::Runnable(Wakeup::Resolved(resolution));
                    core.progress += 1;
                }
                None => {
                    core.fibers[index].state = FiberState::Blocked(awaiting);
                    core.progress += 1;
                    return Ok(());
                }
            },
            FiberStep::Yield => {
                core.fibers[index].state = FiberState::Runnable(Wakeup::Yielded);
                return Ok(());
            }
            FiberStep::Complete(value) => {
                bodies[index] = None;
                if id == FiberId::ROOT {
                    info!("workflow completed");
                    close_run(core, Command::CompleteWorkflow {
                        result: value.clone(),
                    });
                }
                core.finish_fiber(id, Ok(value));
                return Ok(());
            }
            FiberStep::Fail(error) => {
                bodies[index] = None;
                if id == FiberId::ROOT {
                    let command = root_failure(core, &error);
                    close_run(core, command);
                }
                core.finish_fiber(id, Err(error));
                return Ok(());
            }
            FiberStep::ContinueAsNew { input } => {
                if id != FiberId::ROOT {
                    return Err(EngineError::invalid_step(format!(
                        "{} asked to continue as new; only the workflow fiber can",
                        id
                    )));
                }
                bodies[index] = None;
                info!("workflow continuing as new");
                let workflow_type = core.run.workflow_type.clone();
                close_run(core, Command::ContinueAsNew {
                    workflow_type,
                    input,
                });
                core.finish_fiber(id, Ok(serde_json::Value::Null));
                return Ok(());
            }
        }
    }
}

fn root_failure(core: &RunCore, error: &WorkflowError) -> Command {
    if error.is_cancellation() && core.scopes.is_cancel_requested(ScopeId::ROOT) {
        info!(details = %error.message, "workflow cancelled");
        Command::CancelWorkflow {
            details: error.message.clone(),
        }
    } else {
        error!(error = %error.message, "workflow failed");
        Command::FailWorkflow {
            error: error.clone(),
        }
    }
}

fn close_run(core: &mut RunCore, command: Command) {
    core.commands.push(command);
    core.closing = true;
    core.progress += 1;
}

fn table_error(err: TableError) -> EngineError {
    match err {
        TableError::UnknownOperation(id) => NonDeterminismError::new(format!(
            "history refers to {} which the workflow never created",
            id
        ))
        .into(),
        err @ TableError::InvalidTransition { .. } => {
            NonDeterminismError::new(err.to_string()).into()
        }
    }
}
