// SPDX-License-Identifier: MIT OR Apache-2.0

//! Non-destructive graph adapters.
//!
//! An adapter is built next to its *target* node without touching the live
//! graph. [`Adapter::inject`] swaps the adapter in at the target's position;
//! [`Adapter::eject`] swaps the target back. The adapter only keeps the
//! target's [`NodeId`], so the target's subtree is never copied or rebuilt.
//!
//! - [`injection`]: splice points that hold borrowed parameter leaves.
//! - [`projection`]: image embedding to pseudo-token projection.
//! - [`cross_attention`]: per-site text + image cross-attention.
//! - [`ip_adapter`]: the top-level image-prompt adapter.

pub mod cross_attention;
pub mod injection;
pub mod ip_adapter;
pub mod projection;

use candle_core::Tensor;

use crate::error::{AdapterError, Result};
use crate::graph::{Graph, NodeId};

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// A reversible structural substitution of one node.
///
/// Injections and ejections mutate the graph and must not overlap;
/// callers serialize them (the `&mut Graph` receiver enforces this within
/// one graph).
pub trait Adapter {
    /// The node this adapter stands in for.
    fn target(&self) -> NodeId;

    /// The adapter's own root node.
    fn node(&self) -> NodeId;

    /// Whether the adapter currently replaces its target in the live graph.
    fn is_injected(&self) -> bool;

    /// Splice the adapter in place of its target.
    ///
    /// With `parent = None` the target's current parent is looked up; a
    /// target that is the graph root is replaced as root.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if the graph does not have the
    /// shape the adapter expects. Nothing is modified in that case.
    fn inject(&mut self, graph: &mut Graph, parent: Option<NodeId>) -> Result<()>;

    /// Undo [`inject`](Self::inject), restoring the target at the position
    /// the adapter occupies.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if the adapter is not injected
    /// or its splice points are not in the injected state.
    fn eject(&mut self, graph: &mut Graph) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// Where a substitution happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// The node is the graph root.
    Root,
    /// The node is a child of this container.
    Child(NodeId),
}

/// Non-owning link between an adapter node and its target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Binding {
    /// Node the adapter replaces.
    target: NodeId,
    /// Adapter's root node.
    node: NodeId,
    /// Whether `node` currently stands in for `target`.
    injected: bool,
}

impl Binding {
    /// Link `node` to `target`; nothing is spliced yet.
    pub(crate) const fn new(target: NodeId, node: NodeId) -> Self {
        Self {
            target,
            node,
            injected: false,
        }
    }

    /// Target handle.
    pub(crate) const fn target(&self) -> NodeId {
        self.target
    }

    /// Adapter handle.
    pub(crate) const fn node(&self) -> NodeId {
        self.node
    }

    /// Injection state.
    pub(crate) const fn is_injected(&self) -> bool {
        self.injected
    }

    /// Find where the target sits, without modifying anything.
    pub(crate) fn resolve_target(&self, graph: &Graph, parent: Option<NodeId>) -> Result<Placement> {
        if self.injected {
            return Err(AdapterError::Structure(format!(
                "adapter {} is already injected",
                self.node
            )));
        }
        locate(graph, self.target, parent)
    }

    /// Find where the adapter sits, without modifying anything.
    pub(crate) fn resolve_node(&self, graph: &Graph) -> Result<Placement> {
        if !self.injected {
            return Err(AdapterError::Structure(format!(
                "adapter {} is not injected",
                self.node
            )));
        }
        locate(graph, self.node, None)
    }

    /// Put the adapter where the target was.
    pub(crate) fn substitute(&mut self, graph: &mut Graph, placement: Placement) -> Result<()> {
        swap(graph, placement, self.target, self.node)?;
        self.injected = true;
        Ok(())
    }

    /// Put the target back where the adapter is.
    pub(crate) fn restore(&mut self, graph: &mut Graph, placement: Placement) -> Result<()> {
        swap(graph, placement, self.node, self.target)?;
        self.injected = false;
        Ok(())
    }
}

/// Placement of `id`, checking an explicit `parent` if one is given.
fn locate(graph: &Graph, id: NodeId, parent: Option<NodeId>) -> Result<Placement> {
    match parent {
        Some(parent) => {
            if graph.position_of(parent, id)?.is_some() {
                Ok(Placement::Child(parent))
            } else {
                Err(AdapterError::Structure(format!(
                    "{id} is not a child of {parent}"
                )))
            }
        }
        None if graph.root() == Some(id) => Ok(Placement::Root),
        None => graph
            .parent_of(id)
            .map(Placement::Child)
            .ok_or_else(|| AdapterError::Structure(format!("{id} is not attached to the graph"))),
    }
}

/// Replace `old` by `new` at `placement`.
fn swap(graph: &mut Graph, placement: Placement, old: NodeId, new: NodeId) -> Result<()> {
    match placement {
        Placement::Root => graph.set_root(new),
        Placement::Child(parent) => graph.replace_child(parent, old, new).map(|_| ()),
    }
}

// ---------------------------------------------------------------------------
// Context helpers
// ---------------------------------------------------------------------------

/// Build the context tensor every adapted site expects: text tokens
/// followed by image pseudo-tokens along the sequence axis.
///
/// # Shapes
/// - `text_embedding`: `[batch, text_sequence_length, dim]`
/// - `image_embedding`: `[batch, image_sequence_length, dim]`
/// - returns: `[batch, text_sequence_length + image_sequence_length, dim]`
///
/// # Errors
///
/// Returns [`AdapterError::Model`] if batch or width disagree.
pub fn concat_context(text_embedding: &Tensor, image_embedding: &Tensor) -> Result<Tensor> {
    Ok(Tensor::cat(&[text_embedding, image_embedding], 1)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
