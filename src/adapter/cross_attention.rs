// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-site text + image cross-attention.
//!
//! A [`CrossAttentionAdapter`] stands in for one attention node. It is
//! called like the target, with `(query_source, context, context)` where
//! `context` is text tokens followed by image pseudo-tokens, and computes
//!
//! ```text
//! out = to_out( attn(q, k_text, v_text) + scale * attn(q, k_image, v_image) )
//! ```
//!
//! `to_q`, `to_k`, `to_v` and `to_out` are the target's own linear leaves,
//! borrowed through four injection points. Only the image key and image
//! value projections are new parameters.
//!
//! Layout (state-dict names in brackets):
//!
//! ```text
//! Chain
//! ├── Distribute                                  [Distribute]
//! │   ├── InjectionPoint <- to_q
//! │   ├── Parallel                                [Parallel_1]
//! │   │   ├── Chain(Slicing text, InjectionPoint <- to_k)
//! │   │   └── Chain(Slicing image, Linear)        [Chain_2.Linear]
//! │   └── Parallel                                [Parallel_2]
//! │       ├── Chain(Slicing text, InjectionPoint <- to_v)
//! │       └── Chain(Slicing image, Linear)        [Chain_2.Linear]
//! ├── Sum
//! │   ├── Chain(Select text, ScaledDotProductAttention)
//! │   └── Chain(Select image, ScaledDotProductAttention, Multiply scale)
//! └── InjectionPoint <- to_out
//! ```
//!
//! Self-attention kinds additionally start with the
//! `Parallel(Identity, Identity, Identity)` fan-out their target carries,
//! so the adapter takes the same single input.

use std::collections::HashMap;

use candle_core::Tensor;

use super::injection::{attach, detach, expect_len, injection_point, injection_points};
use super::{Adapter, Binding};
use crate::config::CrossAttentionConfig;
use crate::error::{AdapterError, Result};
use crate::graph::{
    AttentionKind, AttentionMeta, ContainerKind, CrossAttnIndex, Graph, Node, NodeId, Visit,
};
use crate::layers::{fresh_var_builder, linear};

/// Number of linear leaves an adaptable attention node exposes:
/// query, key, value, output.
pub const ATTENTION_LINEAR_COUNT: usize = 4;

/// Adapter splitting one cross-attention into text and image attentions.
#[derive(Debug, Clone)]
pub struct CrossAttentionAdapter {
    /// Link to the wrapped attention node.
    binding: Binding,
    /// Sequence lengths and image-branch multiplier.
    config: CrossAttentionConfig,
    /// Target attributes captured at construction.
    meta: AttentionMeta,
    /// New image-key projection.
    image_key: NodeId,
    /// New image-value projection.
    image_value: NodeId,
}

impl CrossAttentionAdapter {
    /// Build an adapter for the attention node `target`.
    ///
    /// The live graph is not modified; new nodes are added to the arena
    /// only.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if `target` is not an attention
    /// node or does not expose exactly four linear leaves outside LoRA
    /// wrappers, and [`AdapterError::Model`] if parameter initialisation
    /// fails.
    pub fn new(graph: &mut Graph, target: NodeId, config: CrossAttentionConfig) -> Result<Self> {
        let meta = graph
            .node(target)?
            .attention_meta()
            .copied()
            .ok_or_else(|| {
                AdapterError::Structure(format!("{target} is not an attention node"))
            })?;
        target_linears(graph, target)?;

        let device = graph.device_of(target)?;
        let dtype = graph.dtype_of(target)?;
        let (_varmap, vb) = fresh_var_builder(dtype, &device);

        let text = config.text_sequence_length;
        let image = config.image_sequence_length;

        let query = injection_point(graph);
        let (keys, image_key) = {
            let text_key = injection_point(graph);
            let image_key = linear(
                graph,
                meta.key_embedding_dim,
                meta.inner_dim,
                meta.use_bias,
                vb.pp("image_key"),
            )?;
            (split_branch(graph, text, image, text_key, image_key)?, image_key)
        };
        let (values, image_value) = {
            let text_value = injection_point(graph);
            let image_value = linear(
                graph,
                meta.key_embedding_dim,
                meta.inner_dim,
                meta.use_bias,
                vb.pp("image_value"),
            )?;
            (split_branch(graph, text, image, text_value, image_value)?, image_value)
        };
        let projections = graph.container(ContainerKind::Distribute, vec![query, keys, values])?;

        let text_attention = {
            let select = graph.add(Node::Select(CrossAttnIndex::Text));
            let sdpa = sdpa(graph, &meta);
            graph.chain(vec![select, sdpa])?
        };
        let image_attention = {
            let select = graph.add(Node::Select(CrossAttnIndex::Image));
            let sdpa = sdpa(graph, &meta);
            let multiply = graph.add(Node::Multiply(config.scale));
            graph.chain(vec![select, sdpa, multiply])?
        };
        let attentions =
            graph.container(ContainerKind::Sum, vec![text_attention, image_attention])?;

        let output = injection_point(graph);

        let mut children = Vec::with_capacity(4);
        if matches!(
            meta.kind,
            AttentionKind::SelfAttention | AttentionKind::SelfAttention2d
        ) {
            let sources = (0..3).map(|_| graph.add(Node::Identity)).collect();
            children.push(graph.container(ContainerKind::Parallel, sources)?);
        }
        children.extend([projections, attentions, output]);
        let node = graph.chain(children)?;

        Ok(Self {
            binding: Binding::new(target, node),
            config,
            meta,
            image_key,
            image_value,
        })
    }

    /// Overwrite the adapter's parameters from a bundle keyed relative to
    /// the adapter, e.g. `Distribute.Parallel_1.Chain_2.Linear.weight`.
    ///
    /// # Errors
    ///
    /// See [`Graph::load_state_dict`].
    pub fn load_weights(&self, graph: &mut Graph, bundle: &HashMap<String, Tensor>) -> Result<usize> {
        graph.load_state_dict(self.binding.node(), bundle)
    }

    /// Sequence lengths and scale.
    #[must_use]
    pub const fn config(&self) -> &CrossAttentionConfig {
        &self.config
    }

    /// Image-branch multiplier.
    #[must_use]
    pub const fn scale(&self) -> f64 {
        self.config.scale
    }

    /// Attributes of the target attention node.
    #[must_use]
    pub const fn meta(&self) -> &AttentionMeta {
        &self.meta
    }

    /// The image-key projection leaf.
    #[must_use]
    pub const fn image_key(&self) -> NodeId {
        self.image_key
    }

    /// The image-value projection leaf.
    #[must_use]
    pub const fn image_value(&self) -> NodeId {
        self.image_value
    }
}

impl Adapter for CrossAttentionAdapter {
    fn target(&self) -> NodeId {
        self.binding.target()
    }

    fn node(&self) -> NodeId {
        self.binding.node()
    }

    fn is_injected(&self) -> bool {
        self.binding.is_injected()
    }

    fn inject(&mut self, graph: &mut Graph, parent: Option<NodeId>) -> Result<()> {
        let placement = self.binding.resolve_target(graph, parent)?;
        let linears = target_linears(graph, self.target())?;
        let points = adapter_points(graph, self.node())?;
        for &point in &points {
            expect_len(graph, point, 0)?;
        }

        for (&point, &leaf) in points.iter().zip(&linears) {
            attach(graph, point, leaf)?;
        }
        self.binding.substitute(graph, placement)?;
        tracing::debug!(site = %self.target(), adapter = %self.node(), "injected cross-attention adapter");
        Ok(())
    }

    fn eject(&mut self, graph: &mut Graph) -> Result<()> {
        let placement = self.binding.resolve_node(graph)?;
        let points = adapter_points(graph, self.node())?;
        for &point in &points {
            expect_len(graph, point, 1)?;
        }

        for &point in &points {
            detach(graph, point)?;
        }
        self.binding.restore(graph, placement)?;
        tracing::debug!(site = %self.target(), adapter = %self.node(), "ejected cross-attention adapter");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `Parallel(Chain(Slicing text, text_leaf), Chain(Slicing image, image_leaf))`.
fn split_branch(
    graph: &mut Graph,
    text_length: usize,
    image_length: usize,
    text_leaf: NodeId,
    image_leaf: NodeId,
) -> Result<NodeId> {
    let text_slice = graph.add(Node::Slicing {
        dim: 1,
        start: 0,
        length: text_length,
    });
    let image_slice = graph.add(Node::Slicing {
        dim: 1,
        start: text_length,
        length: image_length,
    });
    let text = graph.chain(vec![text_slice, text_leaf])?;
    let image = graph.chain(vec![image_slice, image_leaf])?;
    graph.container(ContainerKind::Parallel, vec![text, image])
}

/// Attention kernel node with the target's head count and causality.
fn sdpa(graph: &mut Graph, meta: &AttentionMeta) -> NodeId {
    graph.add(Node::ScaledDotProductAttention {
        num_heads: meta.num_heads,
        is_causal: meta.is_causal,
    })
}

/// The target's query, key, value and output linears, in that order.
///
/// Linears under a LoRA wrapper are adaptations of their own and are never
/// matched; the wrapper's whole subtree is skipped.
fn target_linears(graph: &Graph, target: NodeId) -> Result<Vec<NodeId>> {
    let linears = graph.walk(target, |_, node| {
        if node.is_lora() {
            Visit::Prune
        } else if node.is_linear() {
            Visit::Match
        } else {
            Visit::Descend
        }
    })?;
    if linears.len() != ATTENTION_LINEAR_COUNT {
        return Err(AdapterError::Structure(format!(
            "attention {target} exposes {} linear layers, expected {ATTENTION_LINEAR_COUNT}",
            linears.len()
        )));
    }
    Ok(linears)
}

/// The adapter's query, key, value and output injection points.
fn adapter_points(graph: &Graph, node: NodeId) -> Result<Vec<NodeId>> {
    let points = injection_points(graph, node)?;
    if points.len() != ATTENTION_LINEAR_COUNT {
        return Err(AdapterError::Structure(format!(
            "adapter {node} has {} injection points, expected {ATTENTION_LINEAR_COUNT}",
            points.len()
        )));
    }
    Ok(points)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
