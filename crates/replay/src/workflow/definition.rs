//! Workflow trait definition

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::Fiber;

/// Error code carried by a [`WorkflowError`] that reports cancellation
pub const CANCELED_CODE: &str = "CANCELED";

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    #[serde(default)]
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Create an error reporting that the work was cancelled
    ///
    /// A root fiber that fails with this error while the run's root scope
    /// is cancel-requested closes the run as canceled rather than failed.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(message).with_code(CANCELED_CODE)
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.code.as_deref() == Some(CANCELED_CODE)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A workflow is the root fiber of a run
///
/// The engine builds a fresh instance from the run's input every time the
/// run is replayed, then drives it through [`Fiber::resume`]. Everything the
/// workflow does must go through the [`WorkflowContext`](super::WorkflowContext)
/// so that a replay makes exactly the same decisions.
///
/// # Example
///
/// ```ignore
/// use everruns_replay::prelude::*;
///
/// struct Greeting {
///     name: String,
///     activity: Option<OperationId>,
/// }
///
/// impl Workflow for Greeting {
///     const TYPE: &'static str = "greeting";
///     type Input = String;
///
///     fn new(input: Self::Input) -> Self {
///         Self { name: input, activity: None }
///     }
/// }
///
/// impl Fiber for Greeting {
///     fn resume(
///         &mut self,
///         ctx: &mut WorkflowContext<'_>,
///         wakeup: Wakeup,
///     ) -> Result<FiberStep, EngineError> {
///         match (self.activity, wakeup) {
///             (None, _) => {
///                 let id = ctx.schedule_activity(
///                     "greet",
///                     json!({ "name": self.name }),
///                     ActivityOptions::default(),
///                 )?;
///                 self.activity = Some(id);
///                 Ok(FiberStep::await_operation(id))
///             }
///             (Some(_), wakeup) => Ok(FiberStep::from_result(wakeup.into_result())),
///         }
///     }
/// }
/// ```
pub trait Workflow: Fiber + Sized + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// This is called both when starting a new workflow and when replaying.
    fn new(input: Self::Input) -> Self;
}
