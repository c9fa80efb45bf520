//! Options attached to operation-initiating calls

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_millis;

/// How an operation reacts when its owning scope is cancelled
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancellationType {
    /// Request cancellation and resolve once the service confirms the
    /// request reached the target
    WaitCancellationRequested,

    /// Request cancellation and stay pending until the target itself ends
    #[default]
    WaitCancellationCompleted,

    /// Request cancellation and resolve immediately
    TryCancel,

    /// Never request cancellation; resolve immediately and let the target
    /// run to its natural conclusion
    Abandon,
}

impl CancellationType {
    /// Whether scope cancellation sends a cancel request to the target
    pub fn sends_request(&self) -> bool {
        !matches!(self, Self::Abandon)
    }

    /// Whether the awaiting fiber is released as soon as cancellation starts
    pub fn resolves_immediately(&self) -> bool {
        matches!(self, Self::TryCancel | Self::Abandon)
    }
}

/// Retry configuration forwarded to the service with an activity
///
/// The engine never retries anything itself; a failed activity reaches
/// workflow code only after the service has exhausted this policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Initial delay before first retry
    #[serde(with = "serde_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "serde_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Explicit activity id; defaults to the operation id
    #[serde(default)]
    pub activity_id: Option<String>,

    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for activity to be claimed by a worker
    #[serde(with = "serde_millis")]
    pub schedule_to_start_timeout: Duration,

    /// Maximum time for activity execution (from start to completion)
    #[serde(with = "serde_millis")]
    pub start_to_close_timeout: Duration,

    /// If set, workers must send heartbeats within this interval
    #[serde(default, with = "serde_millis::option")]
    pub heartbeat_timeout: Option<Duration>,

    /// Behavior when the owning scope is cancelled
    #[serde(default)]
    pub cancellation_type: CancellationType,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            activity_id: None,
            retry_policy: RetryPolicy::default(),
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
            cancellation_type: CancellationType::default(),
        }
    }
}

impl ActivityOptions {
    /// Set an explicit activity id
    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Enable heartbeating with the specified timeout
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_cancellation_type(mut self, cancellation_type: CancellationType) -> Self {
        self.cancellation_type = cancellation_type;
        self
    }
}

/// Options for starting a child workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildWorkflowOptions {
    /// Business identifier of the child
    pub workflow_id: String,

    /// Optional bound on the child's whole execution
    #[serde(default, with = "serde_millis::option")]
    pub execution_timeout: Option<Duration>,

    /// Behavior when the owning scope is cancelled
    #[serde(default)]
    pub cancellation_type: CancellationType,
}

impl ChildWorkflowOptions {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_timeout: None,
            cancellation_type: CancellationType::default(),
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_cancellation_type(mut self, cancellation_type: CancellationType) -> Self {
        self.cancellation_type = cancellation_type;
        self
    }
}
