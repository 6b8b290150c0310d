// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention blocks and the scaled dot-product attention kernel.
//!
//! An attention node is an [`Attention`](ContainerKind::Attention)
//! container laid out as
//!
//! ```text
//! Distribute(to_q, to_k, to_v) -> ScaledDotProductAttention -> to_out
//! ```
//!
//! and called with `(x, key_source, value_source)`. Self-attention kinds
//! prepend `Parallel(Identity, Identity, Identity)` so they take `x` alone.
//! Either way the four projections are the only linear leaves inside.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::linear;
use crate::config::AttentionConfig;
use crate::error::{AdapterError, Result};
use crate::graph::{AttentionKind, AttentionMeta, ContainerKind, Graph, Node, NodeId};

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Multi-head scaled dot-product attention.
///
/// # Shapes
/// - `query`: `[batch, q_len, inner_dim]`
/// - `key`: `[batch, kv_len, inner_dim]`
/// - `value`: `[batch, kv_len, inner_dim]`
/// - returns: `[batch, q_len, inner_dim]`
///
/// # Errors
///
/// Returns [`AdapterError::Forward`] if `num_heads` does not divide
/// `inner_dim`, and [`AdapterError::Model`] on tensor operation failures.
pub fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    num_heads: usize,
    is_causal: bool,
) -> Result<Tensor> {
    let (batch, q_len, inner_dim) = query.dims3()?;
    let (_, kv_len, _) = key.dims3()?;
    if num_heads == 0 || inner_dim % num_heads != 0 {
        return Err(AdapterError::Forward(format!(
            "{num_heads} heads do not divide inner dim {inner_dim}"
        )));
    }
    let head_dim = inner_dim / num_heads;

    let q = split_heads(query, num_heads, head_dim)?;
    let k = split_heads(key, num_heads, head_dim)?;
    let v = split_heads(value, num_heads, head_dim)?;

    // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
    let k_t = k.transpose(2, 3)?.contiguous()?;

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let scale = 1.0 / (head_dim as f64).sqrt();
    let mut scores = (q.matmul(&k_t)? * scale)?;

    if is_causal {
        let mask = causal_mask(q_len, kv_len, scores.device(), scores.dtype())?;
        scores = scores.broadcast_add(&mask)?;
    }

    // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
    let original_dtype = scores.dtype();
    let scores_f32 = if original_dtype == DType::F32 {
        scores
    } else {
        scores.to_dtype(DType::F32)?
    };
    let mut pattern = candle_nn::ops::softmax_last_dim(&scores_f32)?;
    if original_dtype != DType::F32 {
        pattern = pattern.to_dtype(original_dtype)?;
    }

    let out = pattern.matmul(&v)?;

    // [batch, heads, q_len, head_dim] -> [batch, q_len, inner_dim]
    Ok(out
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, q_len, inner_dim))?)
}

/// `[batch, len, heads * head_dim]` to `[batch, heads, len, head_dim]`.
fn split_heads(xs: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, len, _) = xs.dims3()?;
    Ok(xs
        .reshape((batch, len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?)
}

/// Additive mask, `-inf` where key position `j` lies after query position `i`.
///
/// # Shapes
/// - returns: `[q_len, kv_len]`
fn causal_mask(q_len: usize, kv_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| (0..kv_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (q_len, kv_len), device)?.to_dtype(dtype)?)
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Add an [`AttentionKind::Attention`] node loading `to_q`, `to_k`, `to_v`,
/// `to_out` from `vb`.
///
/// # Errors
///
/// Returns [`AdapterError::Config`] if `num_heads` does not divide
/// `inner_dim`, and [`AdapterError::Model`] if weight loading fails.
pub fn load(graph: &mut Graph, config: &AttentionConfig, vb: VarBuilder<'_>) -> Result<NodeId> {
    build(graph, config, AttentionKind::Attention, vb)
}

/// Add an [`AttentionKind::SelfAttention`] node (key and value widths are
/// forced to `embedding_dim`).
///
/// # Errors
///
/// Same as [`load`].
pub fn self_attention(
    graph: &mut Graph,
    config: &AttentionConfig,
    vb: VarBuilder<'_>,
) -> Result<NodeId> {
    build(graph, config, AttentionKind::SelfAttention, vb)
}

/// Add an [`AttentionKind::SelfAttention2d`] node. Its input is the
/// feature map already flattened to `[batch, height * width, channels]`.
///
/// # Errors
///
/// Same as [`load`].
pub fn self_attention_2d(
    graph: &mut Graph,
    config: &AttentionConfig,
    vb: VarBuilder<'_>,
) -> Result<NodeId> {
    build(graph, config, AttentionKind::SelfAttention2d, vb)
}

/// Wrap `attention` so it reads its key and value sources from the forward
/// context entry `context_key`:
/// `Chain(Parallel(Identity, UseContext, UseContext), attention)`.
///
/// # Errors
///
/// Returns [`AdapterError::Structure`] if `attention` is unknown.
pub fn cross_attention_block(
    graph: &mut Graph,
    attention: NodeId,
    context_key: &str,
) -> Result<NodeId> {
    let identity = graph.add(Node::Identity);
    let key = graph.add(Node::UseContext(context_key.to_owned()));
    let value = graph.add(Node::UseContext(context_key.to_owned()));
    let sources = graph.container(ContainerKind::Parallel, vec![identity, key, value])?;
    graph.chain(vec![sources, attention])
}

/// Shared body of the attention builders.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
fn build(
    graph: &mut Graph,
    config: &AttentionConfig,
    kind: AttentionKind,
    vb: VarBuilder<'_>,
) -> Result<NodeId> {
    if config.num_heads == 0 || config.inner_dim % config.num_heads != 0 {
        return Err(AdapterError::Config(format!(
            "{} heads do not divide inner dim {}",
            config.num_heads, config.inner_dim
        )));
    }
    let is_self = matches!(
        kind,
        AttentionKind::SelfAttention | AttentionKind::SelfAttention2d
    );
    let (key_dim, value_dim) = if is_self {
        (config.embedding_dim, config.embedding_dim)
    } else {
        (config.key_embedding_dim, config.value_embedding_dim)
    };

    let to_q = linear(graph, config.embedding_dim, config.inner_dim, config.use_bias, vb.pp("to_q"))?;
    let to_k = linear(graph, key_dim, config.inner_dim, config.use_bias, vb.pp("to_k"))?;
    let to_v = linear(graph, value_dim, config.inner_dim, config.use_bias, vb.pp("to_v"))?;
    let to_out = linear(graph, config.inner_dim, config.embedding_dim, true, vb.pp("to_out"))?;

    let projections = graph.container(ContainerKind::Distribute, vec![to_q, to_k, to_v])?;
    let sdpa = graph.add(Node::ScaledDotProductAttention {
        num_heads: config.num_heads,
        is_causal: config.is_causal,
    });

    let mut children = Vec::with_capacity(4);
    if is_self {
        let sources = (0..3).map(|_| graph.add(Node::Identity)).collect();
        children.push(graph.container(ContainerKind::Parallel, sources)?);
    }
    children.extend([projections, sdpa, to_out]);

    let meta = AttentionMeta {
        kind,
        num_heads: config.num_heads,
        is_causal: config.is_causal,
        embedding_dim: config.embedding_dim,
        key_embedding_dim: key_dim,
        value_embedding_dim: value_dim,
        inner_dim: config.inner_dim,
        use_bias: config.use_bias,
    };
    graph.container(ContainerKind::Attention(meta), children)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
