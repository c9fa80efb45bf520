//! Drives one run's engine against the service

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{CommandSink, HistoryFeed, ServiceError};
use crate::command::Command;
use crate::engine::{
    replay_history, EngineConfig, EngineError, ReplayEngine, ReplayOutcome, WorkflowRegistry,
};
use crate::history::HistoryEvent;

/// Errors from driving a run
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Pulls history for a run, advances its engine, and submits commands
///
/// The engine lives in memory between work units. [`RunDriver::restart`]
/// drops it and rebuilds state by replaying the full history, which is
/// what a worker does after losing a run's cached engine.
pub struct RunDriver {
    run_id: Uuid,
    feed: Arc<dyn HistoryFeed>,
    sink: Arc<dyn CommandSink>,
    registry: Arc<WorkflowRegistry>,
    config: EngineConfig,
    engine: ReplayEngine,
}

impl RunDriver {
    pub fn new(
        run_id: Uuid,
        feed: Arc<dyn HistoryFeed>,
        sink: Arc<dyn CommandSink>,
        registry: Arc<WorkflowRegistry>,
        config: EngineConfig,
    ) -> Self {
        let engine = ReplayEngine::new(registry.clone(), config.clone());
        Self {
            run_id,
            feed,
            sink,
            registry,
            config,
            engine,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn engine(&self) -> &ReplayEngine {
        &self.engine
    }

    /// Whether the run's terminal event has been applied
    pub fn is_finished(&self) -> bool {
        self.engine.is_finished()
    }

    /// Process the events recorded since the last call
    ///
    /// Returns the commands submitted, or `None` if there was nothing new.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn process_next(&mut self) -> Result<Option<Vec<Command>>, DriverError> {
        let events = self
            .feed
            .poll_history(self.run_id, self.engine.last_sequence_id())
            .await?;
        if events.is_empty() {
            return Ok(None);
        }

        self.advance_and_submit(&events).await.map(Some)
    }

    /// Process work units until no new events are pending
    pub async fn run_until_idle(&mut self) -> Result<usize, DriverError> {
        let mut units = 0;
        while !self.is_finished() {
            match self.process_next().await? {
                Some(_) => units += 1,
                None => break,
            }
        }
        Ok(units)
    }

    /// Keep polling until the run finishes or shutdown is signaled
    ///
    /// Sleeps `poll_interval` whenever a poll returns nothing new. Returns
    /// whether the run finished.
    #[instrument(skip(self, shutdown), fields(run_id = %self.run_id))]
    pub async fn run_until_finished(
        &mut self,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<bool, DriverError> {
        while !self.is_finished() {
            if *shutdown.borrow() {
                debug!("driver shutdown requested");
                return Ok(false);
            }
            if self.process_next().await?.is_some() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {
                    debug!("shutdown signal received while idle");
                    return Ok(false);
                }
            }
        }
        info!("run finished");
        Ok(true)
    }

    /// Discard the engine and replay the run from its full history
    ///
    /// The replay ends with whatever live round the history calls for, so
    /// a run that was interrupted mid work unit picks up where it stopped.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn restart(&mut self) -> Result<Vec<Command>, DriverError> {
        self.engine = ReplayEngine::new(self.registry.clone(), self.config.clone());
        let history = self.feed.poll_history(self.run_id, 0).await?;
        info!(events = history.len(), "replaying run from full history");

        self.advance_and_submit(&history).await
    }

    /// Replay the recorded history in a scratch engine
    ///
    /// Nothing is submitted. Fails if the registered workflow code no
    /// longer reproduces the history.
    pub async fn verify_history(&self) -> Result<ReplayOutcome, DriverError> {
        let history = self.feed.fetch_full_history(self.run_id).await?;
        let outcome = replay_history(self.registry.clone(), &history, self.config.clone())?;
        Ok(outcome)
    }

    /// Feeds poll results whole; a poll never ends inside a work unit
    async fn advance_and_submit(
        &mut self,
        events: &[HistoryEvent],
    ) -> Result<Vec<Command>, DriverError> {
        let rounds = self.engine.live_rounds();
        let mut commands = self.engine.advance(events)?;
        commands.extend(self.engine.settle()?);

        if self.engine.live_rounds() > rounds {
            self.sink
                .complete_work_unit(self.run_id, commands.clone())
                .await?;
        } else if !self.engine.is_finished() {
            self.sink.release_work_unit(self.run_id).await?;
        }
        Ok(commands)
    }
}

impl std::fmt::Debug for RunDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunDriver")
            .field("run_id", &self.run_id)
            .field("engine", &self.engine)
            .finish()
    }
}
