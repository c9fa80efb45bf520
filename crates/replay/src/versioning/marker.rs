//! Marker payloads recorded in history

use serde::{Deserialize, Serialize};

/// A deterministic decision made during live execution
///
/// Markers are recorded once, when the decision is first made, and are read
/// back (never re-decided) on every later replay of the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "marker_name", rename_all = "snake_case")]
pub enum Marker {
    /// Version chosen for a change id
    Version { change_id: String, version: i32 },

    /// Result of a non-deterministic computation
    SideEffect {
        side_effect_id: u64,
        value: serde_json::Value,
    },
}

impl Marker {
    /// Whether two markers record the same decision
    ///
    /// Side effect values are not compared: the value in history wins.
    pub fn same_decision(&self, other: &Marker) -> bool {
        match (self, other) {
            (
                Marker::Version {
                    change_id: a,
                    version: va,
                },
                Marker::Version {
                    change_id: b,
                    version: vb,
                },
            ) => a == b && va == vb,
            (
                Marker::SideEffect {
                    side_effect_id: a, ..
                },
                Marker::SideEffect {
                    side_effect_id: b, ..
                },
            ) => a == b,
            _ => false,
        }
    }
}
