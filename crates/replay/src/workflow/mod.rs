//! Workflow-facing API: the workflow trait, fibers, options, and the context

mod context;
mod definition;
mod fiber;
mod options;

pub use context::WorkflowContext;
pub use definition::{Workflow, WorkflowError, CANCELED_CODE};
pub use fiber::{
    fiber_fn, Awaitable, CancellationSignal, Fiber, FiberId, FiberStatus, FiberStep, Resolution,
    Wakeup,
};
pub(crate) use fiber::FiberState;
pub use options::{ActivityOptions, CancellationType, ChildWorkflowOptions, RetryPolicy};
