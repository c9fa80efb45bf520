//! Engine limits

use std::env;

use serde::{Deserialize, Serialize};

/// Configuration for the replay engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum events per run (for safety)
    pub max_history_events: usize,

    /// Scheduler passes allowed before a round is declared livelocked
    pub max_scheduler_passes: usize,

    /// Maximum fibers per run
    pub max_fibers: usize,

    /// Steps a fiber may take in one visit without blocking or yielding
    pub max_steps_per_fiber_visit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_history_events: 50_000,
            max_scheduler_passes: 1_000,
            max_fibers: 1_000,
            max_steps_per_fiber_visit: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (unset or unparsable values keep the default):
    /// - `REPLAY_MAX_HISTORY_EVENTS`
    /// - `REPLAY_MAX_SCHEDULER_PASSES`
    /// - `REPLAY_MAX_FIBERS`
    /// - `REPLAY_MAX_STEPS_PER_FIBER_VISIT`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_history_events: env_usize("REPLAY_MAX_HISTORY_EVENTS")
                .unwrap_or(defaults.max_history_events),
            max_scheduler_passes: env_usize("REPLAY_MAX_SCHEDULER_PASSES")
                .unwrap_or(defaults.max_scheduler_passes),
            max_fibers: env_usize("REPLAY_MAX_FIBERS").unwrap_or(defaults.max_fibers),
            max_steps_per_fiber_visit: env_usize("REPLAY_MAX_STEPS_PER_FIBER_VISIT")
                .unwrap_or(defaults.max_steps_per_fiber_visit),
        }
    }

    pub fn with_max_history_events(mut self, max: usize) -> Self {
        self.max_history_events = max;
        self
    }

    pub fn with_max_scheduler_passes(mut self, max: usize) -> Self {
        self.max_scheduler_passes = max;
        self
    }

    pub fn with_max_fibers(mut self, max: usize) -> Self {
        self.max_fibers = max;
        self
    }

    pub fn with_max_steps_per_fiber_visit(mut self, max: usize) -> Self {
        self.max_steps_per_fiber_visit = max;
        self
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_max_history_events(10)
            .with_max_fibers(2);

        assert_eq!(config.max_history_events, 10);
        assert_eq!(config.max_fibers, 2);
        assert_eq!(config.max_scheduler_passes, 1_000);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({ "max_fibers": 8 })).unwrap();

        assert_eq!(config.max_fibers, 8);
        assert_eq!(config.max_history_events, 50_000);
    }

    #[test]
    fn test_from_env() {
        env::set_var("REPLAY_MAX_SCHEDULER_PASSES", "42");
        env::set_var("REPLAY_MAX_STEPS_PER_FIBER_VISIT", "not-a-number");

        let config = EngineConfig::from_env();
        assert_eq!(config.max_scheduler_passes, 42);
        assert_eq!(config.max_steps_per_fiber_visit, 10_000);

        env::remove_var("REPLAY_MAX_SCHEDULER_PASSES");
        env::remove_var("REPLAY_MAX_STEPS_PER_FIBER_VISIT");
    }
}
