// SPDX-License-Identifier: MIT OR Apache-2.0

//! Splice points.
//!
//! An injection point is an [`InjectionPoint`](ContainerKind::InjectionPoint)
//! container holding zero or one child. While it holds a child, running it
//! is running the child. Adapters leave them empty at build time and fill
//! them with the target's own parameter leaves on injection, so the
//! pretrained weights are shared, never copied.

use crate::error::{AdapterError, Result};
use crate::graph::{ContainerKind, Graph, Node, NodeId};

/// Add an empty injection point.
pub fn injection_point(graph: &mut Graph) -> NodeId {
    graph.add(Node::container(ContainerKind::InjectionPoint))
}

/// Put `child` into the empty injection point `point`.
///
/// # Errors
///
/// Returns [`AdapterError::Structure`] if `point` is not an injection point
/// or already holds a child.
pub fn attach(graph: &mut Graph, point: NodeId, child: NodeId) -> Result<()> {
    expect_len(graph, point, 0)?;
    graph.push_child(point, child)?;
    expect_len(graph, point, 1)
}

/// Take the child out of the occupied injection point `point`.
///
/// # Errors
///
/// Returns [`AdapterError::Structure`] if `point` is not an injection point
/// or is empty.
pub fn detach(graph: &mut Graph, point: NodeId) -> Result<NodeId> {
    expect_len(graph, point, 1)?;
    let child = graph.pop_child(point)?;
    expect_len(graph, point, 0)?;
    Ok(child)
}

/// Injection points below `root`, in declaration order.
///
/// # Errors
///
/// Returns [`AdapterError::Structure`] if the traversal reaches an unknown
/// node.
pub fn injection_points(graph: &Graph, root: NodeId) -> Result<Vec<NodeId>> {
    graph.layers(root, Node::is_injection_point)
}

/// Fail unless `point` is an injection point holding exactly `len` children.
pub(crate) fn expect_len(graph: &Graph, point: NodeId, len: usize) -> Result<()> {
    let node = graph.node(point)?;
    if !node.is_injection_point() {
        return Err(AdapterError::Structure(format!(
            "{point} is a {}, not an InjectionPoint",
            node.type_name()
        )));
    }
    let actual = node.children().len();
    if actual == len {
        Ok(())
    } else {
        Err(AdapterError::Structure(format!(
            "injection point {point} holds {actual} children, expected {len}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
