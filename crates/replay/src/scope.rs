//! Cancellation scope tree
//!
//! Scopes live in an arena indexed by [`ScopeId`]; parent and children are
//! stored as ids, so looking up a parent never keeps it alive. Ids are never
//! reused within a run.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Handle to a cancellation scope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ScopeId(pub(crate) usize);

impl ScopeId {
    /// The workflow's implicit root scope
    pub const ROOT: ScopeId = ScopeId(0);
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScopeRecord {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub children: BTreeSet<ScopeId>,
    pub cancel_requested: bool,

    /// Insulated from the parent's cancellation
    pub detached: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScopeTree {
    scopes: Vec<Option<ScopeRecord>>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    pub fn new() -> Self {
        Self {
            scopes: vec![Some(ScopeRecord {
                id: ScopeId::ROOT,
                parent: None,
                children: BTreeSet::new(),
                cancel_requested: false,
                detached: false,
            })],
        }
    }

    pub fn get(&self, id: ScopeId) -> Option<&ScopeRecord> {
        self.scopes.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: ScopeId) -> Option<&mut ScopeRecord> {
        self.scopes.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: ScopeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live scopes, root included
    pub fn len(&self) -> usize {
        self.scopes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live scopes in id order
    pub fn iter(&self) -> impl Iterator<Item = &ScopeRecord> {
        self.scopes.iter().flatten()
    }

    /// Open a scope under `parent`
    ///
    /// A non-detached scope opened under a cancelled parent starts out
    /// cancelled. Returns `None` if `parent` does not exist.
    pub fn open(&mut self, parent: ScopeId, detached: bool) -> Option<ScopeId> {
        let inherited = {
            let parent_record = self.get(parent)?;
            !detached && parent_record.cancel_requested
        };

        let id = ScopeId(self.scopes.len());
        self.scopes.push(Some(ScopeRecord {
            id,
            parent: Some(parent),
            children: BTreeSet::new(),
            cancel_requested: inherited,
            detached,
        }));
        if let Some(parent_record) = self.get_mut(parent) {
            parent_record.children.insert(id);
        }
        Some(id)
    }

    /// Whether cancellation has reached this scope
    pub fn is_cancel_requested(&self, id: ScopeId) -> bool {
        self.get(id).map(|s| s.cancel_requested).unwrap_or(false)
    }

    /// Request cancellation of `id` and its non-detached descendants
    ///
    /// Idempotent. Returns the scopes whose state changed, parents before
    /// children and siblings in id order.
    pub fn request_cancel(&mut self, id: ScopeId) -> Vec<ScopeId> {
        let mut changed = Vec::new();
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            let Some(record) = self.get_mut(current) else {
                continue;
            };
            if current != id && record.detached {
                continue;
            }
            if !record.cancel_requested {
                record.cancel_requested = true;
                changed.push(current);
            }
            // Reverse so the smallest child is visited first
            stack.extend(record.children.iter().rev().copied());
        }

        changed
    }

    /// Remove a scope, handing its children to its parent
    ///
    /// Returns the parent the scope's remaining contents belong to now.
    /// The root cannot be destroyed.
    pub fn destroy(&mut self, id: ScopeId) -> Option<ScopeId> {
        if id == ScopeId::ROOT {
            return None;
        }
        let record = self.scopes.get_mut(id.0)?.take()?;
        let parent = record.parent.unwrap_or(ScopeId::ROOT);

        for child in &record.children {
            if let Some(child_record) = self.get_mut(*child) {
                child_record.parent = Some(parent);
            }
        }
        if let Some(parent_record) = self.get_mut(parent) {
            parent_record.children.remove(&id);
            parent_record.children.extend(record.children.iter().copied());
        }
        Some(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_exists() {
        let tree = ScopeTree::new();
        assert!(tree.contains(ScopeId::ROOT));
        assert!(!tree.is_cancel_requested(ScopeId::ROOT));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_cancel_propagates_to_non_detached_descendants() {
        let mut tree = ScopeTree::new();
        let a = tree.open(ScopeId::ROOT, false).unwrap();
        let b = tree.open(a, false).unwrap();
        let detached = tree.open(a, true).unwrap();
        let under_detached = tree.open(detached, false).unwrap();

        let changed = tree.request_cancel(ScopeId::ROOT);
        assert_eq!(changed, vec![ScopeId::ROOT, a, b]);

        assert!(tree.is_cancel_requested(b));
        assert!(!tree.is_cancel_requested(detached));
        assert!(!tree.is_cancel_requested(under_detached));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut tree = ScopeTree::new();
        let a = tree.open(ScopeId::ROOT, false).unwrap();

        assert_eq!(tree.request_cancel(a), vec![a]);
        assert!(tree.request_cancel(a).is_empty());
        assert!(!tree.is_cancel_requested(ScopeId::ROOT));
    }

    #[test]
    fn test_detached_scope_cancelled_explicitly() {
        let mut tree = ScopeTree::new();
        let detached = tree.open(ScopeId::ROOT, true).unwrap();
        let inner = tree.open(detached, false).unwrap();

        assert_eq!(tree.request_cancel(detached), vec![detached, inner]);
    }

    #[test]
    fn test_open_under_cancelled_parent() {
        let mut tree = ScopeTree::new();
        tree.request_cancel(ScopeId::ROOT);

        let attached = tree.open(ScopeId::ROOT, false).unwrap();
        let detached = tree.open(ScopeId::ROOT, true).unwrap();
        assert!(tree.is_cancel_requested(attached));
        assert!(!tree.is_cancel_requested(detached));
    }

    #[test]
    fn test_destroy_reparents_children() {
        let mut tree = ScopeTree::new();
        let a = tree.open(ScopeId::ROOT, false).unwrap();
        let b = tree.open(a, false).unwrap();

        assert_eq!(tree.destroy(a), Some(ScopeId::ROOT));
        assert!(!tree.contains(a));
        assert_eq!(tree.get(b).unwrap().parent, Some(ScopeId::ROOT));
        assert!(tree.get(ScopeId::ROOT).unwrap().children.contains(&b));

        // Cancelling the root still reaches the orphan
        assert_eq!(tree.request_cancel(ScopeId::ROOT), vec![ScopeId::ROOT, b]);
    }

    #[test]
    fn test_ids_not_reused() {
        let mut tree = ScopeTree::new();
        let a = tree.open(ScopeId::ROOT, false).unwrap();
        tree.destroy(a);
        let b = tree.open(ScopeId::ROOT, false).unwrap();
        assert_ne!(a, b);
        assert!(tree.destroy(ScopeId::ROOT).is_none());
        assert!(tree.open(a, false).is_none());
    }
}
