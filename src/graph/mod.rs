// SPDX-License-Identifier: MIT OR Apache-2.0

//! Arena-backed computation graph.
//!
//! A [`Graph`] owns every [`Node`]; containers refer to their children by
//! [`NodeId`]. The *live* graph is whatever is reachable from the root.
//! Structural edits (insertion, removal, substitution of a child at its
//! position) are explicit arena operations, so an adapter can keep a
//! handle to the node it replaced without owning it.
//!
//! - `walk`: visitor-driven search with subtree pruning.
//! - `forward`: evaluation of a node on [`Value`]s.
//! - `state`: state-dict naming and parameter loading.

mod forward;
mod node;
mod state;
mod walk;

pub use forward::{ForwardContext, Value};
pub use node::{
    AttentionKind, AttentionMeta, ContainerKind, CrossAttnIndex, LayerNormParams, LinearParams,
    Node, NodeId,
};
pub use walk::Visit;

use candle_core::{DType, Device};

use crate::error::{AdapterError, Result};

/// Arena of computation nodes with a designated root.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// All nodes ever added, indexed by [`NodeId`].
    nodes: Vec<Node>,
    /// Entry point of the live graph.
    root: Option<NodeId>,
}

impl Graph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the arena (live or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current root, if set.
    #[must_use]
    pub const fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Make `id` the root of the live graph.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `id` is not in the arena.
    pub fn set_root(&mut self, id: NodeId) -> Result<()> {
        self.node(id)?;
        self.root = Some(id);
        Ok(())
    }

    // --- Construction ----------------------------------------------------

    /// Add a node to the arena. It is not attached anywhere.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Add a container of `kind` holding `children`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if a child is unknown, or if an
    /// injection point is given more than one child.
    pub fn container(&mut self, kind: ContainerKind, children: Vec<NodeId>) -> Result<NodeId> {
        for &child in &children {
            self.node(child)?;
        }
        if kind == ContainerKind::InjectionPoint && children.len() > 1 {
            return Err(AdapterError::Structure(format!(
                "injection point given {} children",
                children.len()
            )));
        }
        Ok(self.add(Node::Container { kind, children }))
    }

    /// Add a [`Chain`](ContainerKind::Chain) holding `children`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if a child is unknown.
    pub fn chain(&mut self, children: Vec<NodeId>) -> Result<NodeId> {
        self.container(ContainerKind::Chain, children)
    }

    // --- Access ----------------------------------------------------------

    /// Borrow a node.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `id` is not in the arena.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| AdapterError::Structure(format!("unknown node {id}")))
    }

    /// Mutably borrow a node.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `id` is not in the arena.
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| AdapterError::Structure(format!("unknown node {id}")))
    }

    /// Children of `id` (empty for leaves).
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `id` is not in the arena.
    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(self.node(id)?.children())
    }

    /// Mutable child list of a container.
    fn children_mut(&mut self, id: NodeId) -> Result<(ContainerKind, &mut Vec<NodeId>)> {
        match self.node_mut(id)? {
            Node::Container { kind, children } => Ok((*kind, children)),
            other => Err(AdapterError::Structure(format!(
                "{id} is a {} leaf, not a container",
                other.type_name()
            ))),
        }
    }

    // --- Structural edits ------------------------------------------------

    /// Append `child` to the container `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `parent` is not a container,
    /// `child` is unknown, or `parent` is an occupied injection point.
    pub fn push_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.node(child)?;
        let (kind, children) = self.children_mut(parent)?;
        if kind == ContainerKind::InjectionPoint && !children.is_empty() {
            return Err(AdapterError::Structure(format!(
                "injection point {parent} already holds a child"
            )));
        }
        children.push(child);
        Ok(())
    }

    /// Remove and return the last child of `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `parent` is not a container or
    /// has no children.
    pub fn pop_child(&mut self, parent: NodeId) -> Result<NodeId> {
        let (_, children) = self.children_mut(parent)?;
        children
            .pop()
            .ok_or_else(|| AdapterError::Structure(format!("container {parent} is empty")))
    }

    /// Position of `child` among the children of `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `parent` is unknown.
    pub fn position_of(&self, parent: NodeId, child: NodeId) -> Result<Option<usize>> {
        Ok(self.children(parent)?.iter().position(|&c| c == child))
    }

    /// Replace `old` with `new` at the same position in `parent`.
    ///
    /// Returns the position.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `parent` is not a container,
    /// `new` is unknown, or `old` is not a child of `parent`.
    pub fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> Result<usize> {
        self.node(new)?;
        let (_, children) = self.children_mut(parent)?;
        let slot = children
            .iter_mut()
            .enumerate()
            .find(|(_, c)| **c == old)
            .ok_or_else(|| AdapterError::Structure(format!("{old} is not a child of {parent}")))?;
        *slot.1 = new;
        Ok(slot.0)
    }

    /// Container holding `child` in the live graph (searched from the root).
    ///
    /// Returns `None` if `child` is the root or unreachable.
    #[must_use]
    pub fn parent_of(&self, child: NodeId) -> Option<NodeId> {
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let children = self.nodes.get(id.0).map(Node::children).unwrap_or_default();
            if children.contains(&child) {
                return Some(id);
            }
            stack.extend(children.iter().rev());
        }
        None
    }

    /// Whether `id` is reachable from the root.
    #[must_use]
    pub fn is_live(&self, id: NodeId) -> bool {
        self.root == Some(id) || self.parent_of(id).is_some()
    }

    /// `id` and all of its descendants, in pre-order.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `id` is unknown.
    pub fn subtree(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current)?.iter().rev());
        }
        Ok(out)
    }

    // --- Introspection ---------------------------------------------------

    /// Device of the first parameter found under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if the subtree holds no parameter.
    pub fn device_of(&self, id: NodeId) -> Result<Device> {
        self.first_parameter(id, |t| t.device().clone())
    }

    /// Precision of the first parameter found under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if the subtree holds no parameter.
    pub fn dtype_of(&self, id: NodeId) -> Result<DType> {
        self.first_parameter(id, candle_core::Tensor::dtype)
    }

    /// Apply `f` to the first parameter in pre-order under `id`.
    fn first_parameter<T>(&self, id: NodeId, f: impl Fn(&candle_core::Tensor) -> T) -> Result<T> {
        for node in self.subtree(id)? {
            if let Some((_, tensor)) = self.node(node)?.parameters().first() {
                return Ok(f(tensor));
            }
        }
        Err(AdapterError::Structure(format!(
            "subtree {id} holds no parameters"
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Tensor;

    use super::*;

    fn linear(graph: &mut Graph, rows: usize, cols: usize) -> NodeId {
        let weight = Tensor::zeros((rows, cols), DType::F32, &Device::Cpu).unwrap();
        graph.add(Node::Linear(LinearParams::new(weight, None)))
    }

    #[test]
    fn replace_keeps_position() {
        let mut graph = Graph::new();
        let a = graph.add(Node::Identity);
        let b = graph.add(Node::Identity);
        let c = graph.add(Node::Identity);
        let root = graph.chain(vec![a, b]).unwrap();
        graph.set_root(root).unwrap();

        assert_eq!(graph.replace_child(root, b, c).unwrap(), 1);
        assert_eq!(graph.children(root).unwrap(), &[a, c]);
        assert!(graph.replace_child(root, b, c).is_err());
    }

    #[test]
    fn parent_of_searches_live_graph_only() {
        let mut graph = Graph::new();
        let leaf = graph.add(Node::Identity);
        let inner = graph.chain(vec![leaf]).unwrap();
        let root = graph.chain(vec![inner]).unwrap();
        let detached = graph.chain(vec![leaf]).unwrap();

        assert_eq!(graph.parent_of(leaf), None);
        graph.set_root(root).unwrap();
        assert_eq!(graph.parent_of(leaf), Some(inner));
        assert_eq!(graph.parent_of(inner), Some(root));
        assert_eq!(graph.parent_of(root), None);
        assert!(!graph.is_live(detached));
        assert!(graph.is_live(root));
    }

    #[test]
    fn injection_point_holds_one_child() {
        let mut graph = Graph::new();
        let a = graph.add(Node::Identity);
        let b = graph.add(Node::Identity);
        let point = graph
            .container(ContainerKind::InjectionPoint, Vec::new())
            .unwrap();
        graph.push_child(point, a).unwrap();
        assert!(graph.push_child(point, b).is_err());
        assert_eq!(graph.pop_child(point).unwrap(), a);
        assert!(graph.pop_child(point).is_err());
        assert!(
            graph
                .container(ContainerKind::InjectionPoint, vec![a, b])
                .is_err()
        );
    }

    #[test]
    fn leaves_reject_children() {
        let mut graph = Graph::new();
        let leaf = graph.add(Node::Identity);
        let other = graph.add(Node::Identity);
        assert!(graph.push_child(leaf, other).is_err());
    }

    #[test]
    fn subtree_is_pre_order() {
        let mut graph = Graph::new();
        let a = graph.add(Node::Identity);
        let b = graph.add(Node::Identity);
        let inner = graph.chain(vec![a]).unwrap();
        let root = graph.chain(vec![inner, b]).unwrap();
        assert_eq!(graph.subtree(root).unwrap(), vec![root, inner, a, b]);
    }

    #[test]
    fn device_and_dtype_from_first_parameter() {
        let mut graph = Graph::new();
        let id = graph.add(Node::Identity);
        let lin = linear(&mut graph, 2, 3);
        let root = graph.chain(vec![id, lin]).unwrap();
        assert_eq!(graph.dtype_of(root).unwrap(), DType::F32);
        assert!(graph.device_of(root).unwrap().is_cpu());
        assert!(graph.dtype_of(id).is_err());
    }
}
