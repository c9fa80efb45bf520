//! Event history consumed by the engine
//!
//! The history is an append-only log owned by the orchestration service.
//! The engine never generates or reorders it; it only replays it.

mod event;

pub use event::{EventAttributes, EventKind, FailureInfo, HistoryEvent, TimeoutType};
