//! Per-run table of change ids to versions

use std::collections::BTreeMap;

use serde::Serialize;

use crate::engine::{NonDeterminismError, VersionRangeError};

/// Version returned for a change id that the original execution never saw
pub const DEFAULT_VERSION: i32 = -1;

/// How a `get_version` call was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    /// Already resolved earlier in this run; no side effects
    Cached(i32),

    /// Read from a marker in history; its echo is still to be matched
    Replayed(i32),

    /// Absent from replayed history; nothing is recorded
    Unversioned,

    /// Decided now during live execution; a marker must be recorded
    Recorded(i32),
}

impl VersionDecision {
    pub fn version(&self) -> i32 {
        match self {
            Self::Cached(v) | Self::Replayed(v) | Self::Recorded(v) => *v,
            Self::Unversioned => DEFAULT_VERSION,
        }
    }
}

/// Mapping from change id to the version resolved for this run
///
/// Owned by a single run's engine. Markers found in history are preloaded
/// before the code that asks for them runs; once resolved, a change id
/// keeps its version for the rest of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionTable {
    resolved: BTreeMap<String, i32>,
    #[serde(skip)]
    preloaded: BTreeMap<String, i32>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the version resolved for a change id
    pub fn get(&self, change_id: &str) -> Option<i32> {
        self.resolved.get(change_id).copied()
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Iterate resolved entries in change id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.resolved.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Make a historical marker visible to replaying code
    pub(crate) fn preload(
        &mut self,
        change_id: &str,
        version: i32,
    ) -> Result<(), NonDeterminismError> {
        match self.resolved.get(change_id) {
            Some(&existing) if existing != version => Err(NonDeterminismError::new(format!(
                "change '{}' resolved to version {} but history records {}",
                change_id, existing, version
            ))),
            Some(_) => Ok(()),
            None => {
                self.preloaded.insert(change_id.to_string(), version);
                Ok(())
            }
        }
    }

    /// Resolve a change id for the calling code
    pub(crate) fn resolve(
        &mut self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
        replaying: bool,
    ) -> Result<VersionDecision, VersionRangeError> {
        let check = |version: i32| {
            if version < min_supported || version > max_supported {
                Err(VersionRangeError {
                    change_id: change_id.to_string(),
                    version,
                    min_supported,
                    max_supported,
                })
            } else {
                Ok(())
            }
        };

        if let Some(&version) = self.resolved.get(change_id) {
            check(version)?;
            return Ok(VersionDecision::Cached(version));
        }

        let decision = if replaying {
            match self.preloaded.remove(change_id) {
                Some(version) => VersionDecision::Replayed(version),
                None => VersionDecision::Unversioned,
            }
        } else {
            VersionDecision::Recorded(max_supported)
        };

        let version = decision.version();
        check(version)?;
        self.resolved.insert(change_id.to_string(), version);
        Ok(decision)
    }

    /// Record a marker that arrived without a matching `get_version` call
    pub(crate) fn observe_recorded(
        &mut self,
        change_id: &str,
        version: i32,
    ) -> Result<(), NonDeterminismError> {
        self.preloaded.remove(change_id);
        match self.resolved.get(change_id) {
            Some(&existing) if existing != version => Err(NonDeterminismError::new(format!(
                "change '{}' resolved to version {} but history records {}",
                change_id, existing, version
            ))),
            Some(_) => Ok(()),
            None => {
                self.resolved.insert(change_id.to_string(), version);
                Ok(())
            }
        }
    }
}
