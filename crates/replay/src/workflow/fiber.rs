//! Fibers: explicit suspend/resume units of workflow logic
//!
//! A fiber is a state machine the scheduler resumes with a [`Wakeup`]; it
//! answers with the next [`FiberStep`]. Nothing runs between resumes, so
//! the scheduler alone decides the interleaving.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{WorkflowContext, WorkflowError};
use crate::engine::EngineError;
use crate::operation::{OperationFailure, OperationId};
use crate::scope::ScopeId;

/// Identifier of a fiber, equal to its creation index within the run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct FiberId(pub(crate) usize);

impl FiberId {
    /// The workflow's own fiber
    pub const ROOT: FiberId = FiberId(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Something a fiber can block on
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Awaitable {
    Operation(OperationId),
    Fiber(FiberId),
}

impl From<OperationId> for Awaitable {
    fn from(id: OperationId) -> Self {
        Self::Operation(id)
    }
}

impl From<FiberId> for Awaitable {
    fn from(id: FiberId) -> Self {
        Self::Fiber(id)
    }
}

/// Delivered to a fiber blocked on an operation whose scope was cancelled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationSignal {
    /// Scope whose cancellation reached the operation
    pub scope: ScopeId,

    pub operation: Option<OperationId>,

    pub reason: String,
}

impl From<CancellationSignal> for WorkflowError {
    fn from(signal: CancellationSignal) -> Self {
        WorkflowError::cancelled(signal.reason)
    }
}

impl From<OperationFailure> for WorkflowError {
    fn from(failure: OperationFailure) -> Self {
        WorkflowError::new(failure.to_string())
    }
}

/// Outcome handed to a fiber when the thing it awaited resolves
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Operation result, or the output of a joined fiber
    Completed(Value),

    Failed(OperationFailure),

    Cancelled(CancellationSignal),

    /// A joined fiber failed
    FiberFailed(WorkflowError),
}

impl Resolution {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Collapse into the value or a workflow error
    pub fn into_result(self) -> Result<Value, WorkflowError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(failure) => Err(failure.into()),
            Self::Cancelled(signal) => Err(signal.into()),
            Self::FiberFailed(error) => Err(error),
        }
    }
}

/// Why a fiber is being resumed
#[derive(Debug, Clone, PartialEq)]
pub enum Wakeup {
    /// First resume after creation
    Start,

    /// The awaited operation or fiber resolved
    Resolved(Resolution),

    /// Resumed after an explicit yield
    Yielded,
}

impl Wakeup {
    /// Result of the awaited thing; start and yield wakeups carry no value
    pub fn into_result(self) -> Result<Value, WorkflowError> {
        match self {
            Self::Resolved(resolution) => resolution.into_result(),
            Self::Start | Self::Yielded => Ok(Value::Null),
        }
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        match self {
            Self::Resolved(resolution) => Some(resolution),
            _ => None,
        }
    }
}

/// What a fiber does next
#[derive(Debug, Clone, PartialEq)]
pub enum FiberStep {
    /// Block until the operation or fiber resolves
    Await(Awaitable),

    /// Let sibling fibers run; resumed on a later pass
    Yield,

    Complete(Value),

    Fail(WorkflowError),

    /// Close this run and start a fresh one; root fiber only
    ContinueAsNew { input: Value },
}

impl FiberStep {
    pub fn await_operation(id: OperationId) -> Self {
        Self::Await(Awaitable::Operation(id))
    }

    pub fn await_fiber(id: FiberId) -> Self {
        Self::Await(Awaitable::Fiber(id))
    }

    /// Complete with the value or fail with the error
    pub fn from_result(result: Result<Value, WorkflowError>) -> Self {
        match result {
            Ok(value) => Self::Complete(value),
            Err(error) => Self::Fail(error),
        }
    }
}

/// A deterministic unit of workflow logic
///
/// Errors returned from `resume` are fatal to the run. Failures that
/// workflow code wants to report go through [`FiberStep::Fail`].
pub trait Fiber: Send {
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError>;
}

impl<F> Fiber for F
where
    F: FnMut(&mut WorkflowContext<'_>, Wakeup) -> Result<FiberStep, EngineError> + Send,
{
    fn resume(
        &mut self,
        ctx: &mut WorkflowContext<'_>,
        wakeup: Wakeup,
    ) -> Result<FiberStep, EngineError> {
        self(ctx, wakeup)
    }
}

/// Build a fiber from a closure, pinning down its argument types
pub fn fiber_fn<F>(f: F) -> F
where
    F: FnMut(&mut WorkflowContext<'_>, Wakeup) -> Result<FiberStep, EngineError> + Send,
{
    f
}

/// Scheduler-visible state of a fiber
#[derive(Debug, Clone, PartialEq)]
pub enum FiberState {
    Runnable(Wakeup),
    Blocked(Awaitable),
    Completed,
    Failed,
}

impl FiberState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Compact form for snapshots
    pub fn status(&self) -> FiberStatus {
        match self {
            Self::Runnable(_) => FiberStatus::Runnable,
            Self::Blocked(awaiting) => FiberStatus::Blocked(*awaiting),
            Self::Completed => FiberStatus::Completed,
            Self::Failed => FiberStatus::Failed,
        }
    }
}

/// [`FiberState`] without the pending wakeup payload
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "status", content = "awaiting", rename_all = "snake_case")]
pub enum FiberStatus {
    Runnable,
    Blocked(Awaitable),
    Completed,
    Failed,
}
