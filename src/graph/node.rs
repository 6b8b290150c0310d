// SPDX-License-Identifier: MIT OR Apache-2.0

//! Node variants of the computation graph.
//!
//! The set is closed: four combining containers, a placeholder container,
//! two tagged containers (attention, LoRA), and a handful of leaves.

use std::fmt;

use candle_core::{Module, Tensor};

use crate::error::Result;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Handle of a node inside a [`Graph`](super::Graph) arena.
///
/// Ids are never reused: a node stays addressable for the lifetime of the
/// graph even while no container references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in the arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Attention metadata
// ---------------------------------------------------------------------------

/// Concrete attention variant.
///
/// Adapter site selection compares this tag exactly: only
/// [`SelfAttention`](Self::SelfAttention) is excluded, so
/// [`SelfAttention2d`](Self::SelfAttention2d) is still adapted.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    /// Generic attention fed `(query, key, value)` sources explicitly.
    Attention,
    /// Attention whose query, key, and value all come from one input.
    SelfAttention,
    /// Self-attention over a flattened 2D feature map.
    SelfAttention2d,
}

impl AttentionKind {
    /// State-dict name of a container of this kind.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::Attention => "Attention",
            Self::SelfAttention => "SelfAttention",
            Self::SelfAttention2d => "SelfAttention2d",
        }
    }
}

/// Introspectable attributes of an attention node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionMeta {
    /// Concrete variant.
    pub kind: AttentionKind,
    /// Number of heads.
    pub num_heads: usize,
    /// Whether a causal mask is applied.
    pub is_causal: bool,
    /// Query (and output) width.
    pub embedding_dim: usize,
    /// Key input width.
    pub key_embedding_dim: usize,
    /// Value input width.
    pub value_embedding_dim: usize,
    /// Projected width.
    pub inner_dim: usize,
    /// Whether q/k/v projections carry a bias.
    pub use_bias: bool,
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// Combination rule of a container node.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContainerKind {
    /// Children run in sequence; tuple outputs spread into the next call.
    Chain,
    /// Every child receives all inputs; outputs are collected in a tuple.
    Parallel,
    /// Child `i` receives input `i`; outputs are collected in a tuple.
    Distribute,
    /// Every child receives all inputs; outputs are added.
    Sum,
    /// Placeholder holding at most one child; forwards to it.
    InjectionPoint,
    /// Attention block (runs like a chain).
    Attention(AttentionMeta),
    /// Low-rank update: runs like a chain, output multiplied by `scale`.
    Lora {
        /// Output multiplier.
        scale: f64,
    },
}

impl ContainerKind {
    /// State-dict name of a container of this kind.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Chain => "Chain",
            Self::Parallel => "Parallel",
            Self::Distribute => "Distribute",
            Self::Sum => "Sum",
            Self::InjectionPoint => "InjectionPoint",
            Self::Attention(meta) => meta.kind.type_name(),
            Self::Lora { .. } => "Lora",
        }
    }
}

/// Which half of a `(text, image)` key/value pair to route into attention.
///
/// The discriminant is the index into the pair built by the adapter's
/// `Parallel` branches, text first.
#[allow(clippy::exhaustive_enums)] // a pair has exactly two halves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossAttnIndex {
    /// Text cross-attention.
    Text = 0,
    /// Image cross-attention.
    Image = 1,
}

impl CrossAttnIndex {
    /// Position inside the key/value pair.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Text => 0,
            Self::Image => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter-bearing leaves
// ---------------------------------------------------------------------------

/// Parameters of a linear map `y = x W^T + b`.
#[derive(Debug, Clone)]
pub struct LinearParams {
    /// `[out_features, in_features]`.
    pub(crate) weight: Tensor,
    /// `[out_features]`.
    pub(crate) bias: Option<Tensor>,
}

impl LinearParams {
    /// Wrap existing tensors.
    #[must_use]
    pub const fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    /// Weight matrix, `[out_features, in_features]`.
    #[must_use]
    pub const fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias vector, if any.
    #[must_use]
    pub const fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Input width.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Model`](crate::AdapterError::Model) if the
    /// weight is not 2D.
    pub fn in_features(&self) -> Result<usize> {
        Ok(self.weight.dims2()?.1)
    }

    /// Output width.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Model`](crate::AdapterError::Model) if the
    /// weight is not 2D.
    pub fn out_features(&self) -> Result<usize> {
        Ok(self.weight.dims2()?.0)
    }

    /// Apply the map.
    ///
    /// # Shapes
    /// - `xs`: `[..., in_features]`
    /// - returns: `[..., out_features]`
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let linear = candle_nn::Linear::new(self.weight.clone(), self.bias.clone());
        Ok(linear.forward(xs)?)
    }
}

/// Parameters of a layer normalization over the last axis.
#[derive(Debug, Clone)]
pub struct LayerNormParams {
    /// `[normalized_size]`.
    pub(crate) weight: Tensor,
    /// `[normalized_size]`.
    pub(crate) bias: Tensor,
    /// Epsilon for numerical stability.
    pub(crate) eps: f64,
}

impl LayerNormParams {
    /// Wrap existing tensors.
    #[must_use]
    pub const fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    /// Scale vector.
    #[must_use]
    pub const fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Shift vector.
    #[must_use]
    pub const fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Normalize `xs` over its last axis.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let norm = candle_nn::LayerNorm::new(self.weight.clone(), self.bias.clone(), self.eps);
        Ok(norm.forward(xs)?)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A unit of computation.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Node {
    /// Ordered children combined by `kind`.
    Container {
        /// Combination rule.
        kind: ContainerKind,
        /// Children, in evaluation order.
        children: Vec<NodeId>,
    },
    /// Linear map.
    Linear(LinearParams),
    /// Layer normalization over the last axis.
    LayerNorm(LayerNormParams),
    /// Reshape everything after the batch axis to the given dims.
    Reshape(Vec<usize>),
    /// `narrow(dim, start, length)`.
    Slicing {
        /// Axis to slice.
        dim: usize,
        /// First kept position.
        start: usize,
        /// Number of kept positions.
        length: usize,
    },
    /// Multi-head scaled dot-product attention over `(query, key, value)`.
    ScaledDotProductAttention {
        /// Number of heads.
        num_heads: usize,
        /// Whether a causal mask is applied.
        is_causal: bool,
    },
    /// `(query, (k_text, k_image), (v_text, v_image))` to
    /// `(query, k[index], v[index])`.
    Select(CrossAttnIndex),
    /// Multiply by a constant.
    Multiply(f64),
    /// Read a named tensor from the forward context, ignoring inputs.
    UseContext(String),
    /// Return inputs unchanged.
    Identity,
}

impl Node {
    /// Empty container of the given kind.
    #[must_use]
    pub const fn container(kind: ContainerKind) -> Self {
        Self::Container {
            kind,
            children: Vec::new(),
        }
    }

    /// Name used for this node in state-dict keys.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Container { kind, .. } => kind.type_name(),
            Self::Linear(_) => "Linear",
            Self::LayerNorm(_) => "LayerNorm",
            Self::Reshape(_) => "Reshape",
            Self::Slicing { .. } => "Slicing",
            Self::ScaledDotProductAttention { .. } => "ScaledDotProductAttention",
            Self::Select(_) | Self::Multiply(_) => "Lambda",
            Self::UseContext(_) => "UseContext",
            Self::Identity => "Identity",
        }
    }

    /// Children of a container; empty for leaves.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        match self {
            Self::Container { children, .. } => children,
            _ => &[],
        }
    }

    /// Combination rule, if this is a container.
    #[must_use]
    pub const fn container_kind(&self) -> Option<&ContainerKind> {
        match self {
            Self::Container { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Attention attributes, if this is an attention container.
    #[must_use]
    pub const fn attention_meta(&self) -> Option<&AttentionMeta> {
        match self {
            Self::Container {
                kind: ContainerKind::Attention(meta),
                ..
            } => Some(meta),
            _ => None,
        }
    }

    /// Whether this is a container of any kind.
    #[must_use]
    pub const fn is_container(&self) -> bool {
        matches!(self, Self::Container { .. })
    }

    /// Whether this is a linear map.
    #[must_use]
    pub const fn is_linear(&self) -> bool {
        matches!(self, Self::Linear(_))
    }

    /// Whether this is a LoRA wrapper.
    #[must_use]
    pub const fn is_lora(&self) -> bool {
        matches!(
            self,
            Self::Container {
                kind: ContainerKind::Lora { .. },
                ..
            }
        )
    }

    /// Whether this is a splice point.
    #[must_use]
    pub const fn is_injection_point(&self) -> bool {
        matches!(
            self,
            Self::Container {
                kind: ContainerKind::InjectionPoint,
                ..
            }
        )
    }

    /// Named parameters of a leaf, in state-dict order.
    #[must_use]
    pub fn parameters(&self) -> Vec<(&'static str, &Tensor)> {
        match self {
            Self::Linear(p) => {
                let mut params = vec![("weight", &p.weight)];
                if let Some(bias) = &p.bias {
                    params.push(("bias", bias));
                }
                params
            }
            Self::LayerNorm(p) => vec![("weight", &p.weight), ("bias", &p.bias)],
            _ => Vec::new(),
        }
    }

    /// Mutable access to one named parameter.
    pub(crate) fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        match (self, name) {
            (Self::Linear(p), "weight") => Some(&mut p.weight),
            (Self::Linear(p), "bias") => p.bias.as_mut(),
            (Self::LayerNorm(p), "weight") => Some(&mut p.weight),
            (Self::LayerNorm(p), "bias") => Some(&mut p.bias),
            _ => None,
        }
    }

    /// Apply a parameter-bearing leaf to one tensor.
    pub(crate) fn forward_leaf(&self, xs: &Tensor) -> Option<Result<Tensor>> {
        match self {
            Self::Linear(p) => Some(p.forward(xs)),
            Self::LayerNorm(p) => Some(p.forward(xs)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn cross_attn_index_matches_discriminant() {
        assert_eq!(CrossAttnIndex::Text.index(), 0);
        assert_eq!(CrossAttnIndex::Image.index(), 1);
    }

    #[test]
    fn lambda_nodes_share_a_name() {
        assert_eq!(Node::Select(CrossAttnIndex::Text).type_name(), "Lambda");
        assert_eq!(Node::Multiply(0.5).type_name(), "Lambda");
        assert_eq!(
            Node::container(ContainerKind::InjectionPoint).type_name(),
            "InjectionPoint"
        );
    }

    #[test]
    fn linear_parameters_and_widths() {
        let weight = Tensor::zeros((3, 5), DType::F32, &Device::Cpu).unwrap();
        let node = Node::Linear(LinearParams::new(weight, None));
        let names: Vec<_> = node.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weight"]);
        let Node::Linear(p) = &node else {
            unreachable!()
        };
        assert_eq!(p.in_features().unwrap(), 5);
        assert_eq!(p.out_features().unwrap(), 3);
    }

    #[test]
    fn missing_bias_is_not_addressable() {
        let weight = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        let mut node = Node::Linear(LinearParams::new(weight, None));
        assert!(node.parameter_mut("weight").is_some());
        assert!(node.parameter_mut("bias").is_none());
        assert!(node.parameter_mut("scale").is_none());
    }
}
