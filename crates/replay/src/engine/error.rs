//! Engine error taxonomy
//!
//! Every [`EngineError`] is fatal to the run it was raised in. Recoverable
//! failures (operation failures, cancellation) are values delivered to
//! fibers, never errors.

use super::registry::RegistryError;

/// Replay diverged from the recorded history
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{}", location(.sequence_id), .message)]
pub struct NonDeterminismError {
    /// Event at which the divergence was detected
    pub sequence_id: Option<u64>,
    pub message: String,
}

fn location(sequence_id: &Option<u64>) -> String {
    match sequence_id {
        Some(seq) => format!("at event {}: ", seq),
        None => String::new(),
    }
}

impl NonDeterminismError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            sequence_id: None,
            message: message.into(),
        }
    }

    /// Attach the event position, keeping one already set
    pub fn at(mut self, sequence_id: u64) -> Self {
        self.sequence_id.get_or_insert(sequence_id);
        self
    }
}

/// A resolved version falls outside what the calling code supports
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "version {version} of change '{change_id}' is outside the supported range [{min_supported}, {max_supported}]"
)]
pub struct VersionRangeError {
    pub change_id: String,
    pub version: i32,
    pub min_supported: i32,
    pub max_supported: i32,
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Replay diverged from history
    #[error("non-determinism detected {0}")]
    NonDeterminism(#[from] NonDeterminismError),

    /// A `get_version` call site cannot handle the recorded version
    #[error(transparent)]
    VersionRange(#[from] VersionRangeError),

    /// The history violates its own ordering rules
    #[error("invalid history: {0}")]
    InvalidHistory(String),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A fiber asked for something the scheduler cannot do
    #[error("invalid fiber step: {0}")]
    InvalidStep(String),

    /// Fibers kept each other runnable without settling
    #[error("scheduler did not settle after {0} passes")]
    Livelock(usize),

    /// A configured limit was exceeded
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine already failed and refuses further work
    #[error("engine stopped after a fatal error: {0}")]
    Poisoned(String),
}

impl EngineError {
    pub fn invalid_step(message: impl Into<String>) -> Self {
        Self::InvalidStep(message.into())
    }

    pub fn invalid_history(message: impl Into<String>) -> Self {
        Self::InvalidHistory(message.into())
    }

    pub fn is_non_determinism(&self) -> bool {
        matches!(self, Self::NonDeterminism(_))
    }

    /// Attach an event position to a non-determinism error
    pub(crate) fn at(self, sequence_id: u64) -> Self {
        match self {
            Self::NonDeterminism(err) => Self::NonDeterminism(err.at(sequence_id)),
            other => other,
        }
    }
}
