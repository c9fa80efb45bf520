//! Versioning marker protocol
//!
//! Lets workflow code branch on whether a change existed when a run was
//! first executed. The first live `get_version` call for a change id records
//! a marker; replays read the marker back instead of deciding again.

mod marker;
mod table;

pub use marker::Marker;
pub use table::{VersionDecision, VersionTable, DEFAULT_VERSION};
