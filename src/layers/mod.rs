// SPDX-License-Identifier: MIT OR Apache-2.0

//! Builders for parameter-bearing nodes.
//!
//! Parameters come from a [`VarBuilder`]: backed by a `VarMap` for fresh
//! initialisation, or by safetensors for pretrained weights.
//!
//! - [`attention`]: attention blocks and the scaled dot-product kernel.
//! - [`lora`]: low-rank wrapper around an existing linear node.

pub mod attention;
pub mod lora;

use candle_core::{DType, Device};
use candle_nn::init::Init;
use candle_nn::{VarBuilder, VarMap};

use crate::error::Result;
use crate::graph::{Graph, LayerNormParams, LinearParams, Node, NodeId};

/// Default layer-norm epsilon.
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// A [`VarBuilder`] over a fresh [`VarMap`], for newly initialised parameters.
///
/// The map is returned alongside the builder so it outlives every `get`.
#[must_use]
pub fn fresh_var_builder(dtype: DType, device: &Device) -> (VarMap, VarBuilder<'static>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    (varmap, vb)
}

/// Add a linear node `in_features -> out_features`.
///
/// # Errors
///
/// Returns [`AdapterError::Model`](crate::AdapterError::Model) if the
/// weights cannot be fetched or initialised.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub fn linear(
    graph: &mut Graph,
    in_features: usize,
    out_features: usize,
    bias: bool,
    vb: VarBuilder<'_>,
) -> Result<NodeId> {
    let layer = candle_nn::linear_b(in_features, out_features, bias, vb)?;
    let params = LinearParams::new(layer.weight().clone(), layer.bias().cloned());
    Ok(graph.add(Node::Linear(params)))
}

/// Add a layer-norm node over a last axis of width `size`.
///
/// Fresh parameters start as `weight = 1`, `bias = 0`.
///
/// # Errors
///
/// Returns [`AdapterError::Model`](crate::AdapterError::Model) if the
/// weights cannot be fetched or initialised.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub fn layer_norm(graph: &mut Graph, size: usize, eps: f64, vb: VarBuilder<'_>) -> Result<NodeId> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(graph.add(Node::LayerNorm(LayerNormParams::new(weight, bias, eps))))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
