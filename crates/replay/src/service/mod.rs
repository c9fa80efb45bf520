//! Async boundary to the orchestration service

mod driver;
mod feed;
mod memory;

pub use driver::{DriverError, RunDriver};
pub use feed::{CommandSink, HistoryFeed, ServiceError};
pub use memory::InMemoryHistoryService;
