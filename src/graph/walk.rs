// SPDX-License-Identifier: MIT OR Apache-2.0

//! Visitor-driven structural search.
//!
//! The visitor decides per node whether it is a match, whether to look
//! inside it, or whether to skip its subtree entirely. Skipping is a
//! traversal decision, not an error: it never escapes [`Graph::walk`].

use super::{Graph, Node, NodeId};
use crate::error::Result;

/// Traversal decision returned by a [`Graph::walk`] visitor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Record the node; do not look inside it.
    Match,
    /// Not a match; visit its children (no-op for leaves).
    Descend,
    /// Not a match; skip it and everything below it.
    Prune,
    /// End the traversal; matches found so far are returned.
    Stop,
}

impl Graph {
    /// Depth-first, pre-order search below `root` (the root itself is not
    /// offered to the visitor).
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`](crate::AdapterError::Structure)
    /// if the traversal reaches an unknown node.
    pub fn walk<F>(&self, root: NodeId, mut visitor: F) -> Result<Vec<NodeId>>
    where
        F: FnMut(NodeId, &Node) -> Visit,
    {
        let mut matches = Vec::new();
        let mut stack: Vec<NodeId> = self.children(root)?.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let node = self.node(id)?;
            match visitor(id, node) {
                Visit::Match => matches.push(id),
                Visit::Descend => stack.extend(node.children().iter().rev()),
                Visit::Prune => {}
                Visit::Stop => break,
            }
        }
        Ok(matches)
    }

    /// Nodes below `root` satisfying `predicate`, in pre-order, without
    /// descending into matches.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`](crate::AdapterError::Structure)
    /// if the traversal reaches an unknown node.
    pub fn layers<P>(&self, root: NodeId, predicate: P) -> Result<Vec<NodeId>>
    where
        P: Fn(&Node) -> bool,
    {
        self.walk(root, |_, node| {
            if predicate(node) {
                Visit::Match
            } else {
                Visit::Descend
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
