//! Outbound commands and the per-work-unit command builder

mod builder;
mod definition;

pub use builder::{CommandBuilder, EchoMatch};
pub use definition::Command;
