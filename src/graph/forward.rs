// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluation of graph nodes.
//!
//! A node receives a list of [`Value`] arguments and produces one
//! [`Value`]. Inside a chain, a tuple output is spread into the arguments
//! of the next child, which is how `(query, key, value)` triples and
//! `(text, image)` pairs travel between fragments.

use std::collections::HashMap;

use candle_core::Tensor;

use super::{ContainerKind, Graph, Node, NodeId};
use crate::error::{AdapterError, Result};
use crate::layers::attention::scaled_dot_product_attention;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A tensor or a (possibly nested) tuple of values.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Value {
    /// Single tensor.
    Tensor(Tensor),
    /// Ordered tuple.
    Tuple(Vec<Value>),
}

impl Value {
    /// Unwrap a single tensor.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Forward`] if this is a tuple.
    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Self::Tensor(t) => Ok(t),
            Self::Tuple(items) => Err(AdapterError::Forward(format!(
                "expected a tensor, got a {}-tuple",
                items.len()
            ))),
        }
    }

    /// Arguments for the next call: a tuple spreads, a tensor stays whole.
    fn into_args(self) -> Vec<Self> {
        match self {
            Self::Tensor(_) => vec![self],
            Self::Tuple(items) => items,
        }
    }

    /// Inverse of [`into_args`](Self::into_args).
    fn from_args(mut args: Vec<Self>) -> Self {
        if args.len() == 1 {
            if let Some(single) = args.pop() {
                return single;
            }
        }
        Self::Tuple(args)
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Self::Tensor(tensor)
    }
}

// ---------------------------------------------------------------------------
// ForwardContext
// ---------------------------------------------------------------------------

/// Named tensors readable by [`Node::UseContext`] during a forward pass.
///
/// This is how a caller supplies the context (text + image tokens) to
/// every cross-attention block at once.
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    /// Tensors by key.
    tensors: HashMap<String, Tensor>,
}

impl ForwardContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `tensor` under `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, tensor: Tensor) -> &mut Self {
        self.tensors.insert(key.into(), tensor);
        self
    }

    /// Look up a tensor.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Graph {
    /// Evaluate `id` on `inputs`.
    ///
    /// Evaluation is read-only: an adapted graph may be run repeatedly, and
    /// from several threads, between structural edits.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Forward`] on arity mismatches, a missing
    /// context key, or an empty injection point, and
    /// [`AdapterError::Model`] on tensor operation failures.
    pub fn forward(&self, id: NodeId, inputs: Vec<Value>, ctx: &ForwardContext) -> Result<Value> {
        let node = self.node(id)?;
        match node {
            Node::Container { kind, children } => match kind {
                ContainerKind::InjectionPoint if children.is_empty() => Err(
                    AdapterError::Forward(format!("injection point {id} is empty")),
                ),
                ContainerKind::Chain
                | ContainerKind::InjectionPoint
                | ContainerKind::Attention(_) => self.forward_chain(children, inputs, ctx),
                ContainerKind::Lora { scale } => {
                    let out = self.forward_chain(children, inputs, ctx)?.into_tensor()?;
                    Ok(Value::Tensor((out * *scale)?))
                }
                ContainerKind::Parallel => {
                    let outputs = children
                        .iter()
                        .map(|&child| self.forward(child, inputs.clone(), ctx))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Value::Tuple(outputs))
                }
                ContainerKind::Distribute => {
                    if children.len() != inputs.len() {
                        return Err(AdapterError::Forward(format!(
                            "distribute {id} has {} branches but got {} inputs",
                            children.len(),
                            inputs.len()
                        )));
                    }
                    let outputs = children
                        .iter()
                        .zip(inputs)
                        .map(|(&child, input)| self.forward(child, vec![input], ctx))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Value::Tuple(outputs))
                }
                ContainerKind::Sum => {
                    let mut total: Option<Tensor> = None;
                    for &child in children {
                        let out = self.forward(child, inputs.clone(), ctx)?.into_tensor()?;
                        total = Some(match total {
                            None => out,
                            Some(acc) => (acc + out)?,
                        });
                    }
                    total
                        .map(Value::Tensor)
                        .ok_or_else(|| AdapterError::Forward(format!("sum {id} is empty")))
                }
            },
            Node::Linear(_) | Node::LayerNorm(_) => {
                let xs = single_tensor(id, inputs)?;
                let out = node
                    .forward_leaf(&xs)
                    .ok_or_else(|| AdapterError::Forward(format!("{id} is not a leaf")))??;
                Ok(Value::Tensor(out))
            }
            Node::Reshape(dims) => {
                let xs = single_tensor(id, inputs)?;
                let mut shape = vec![xs.dim(0)?];
                shape.extend_from_slice(dims);
                Ok(Value::Tensor(xs.reshape(shape)?))
            }
            Node::Slicing { dim, start, length } => {
                let xs = single_tensor(id, inputs)?;
                Ok(Value::Tensor(xs.narrow(*dim, *start, *length)?))
            }
            Node::ScaledDotProductAttention {
                num_heads,
                is_causal,
            } => {
                let [query, key, value] = tensors::<3>(id, inputs)?;
                let out =
                    scaled_dot_product_attention(&query, &key, &value, *num_heads, *is_causal)?;
                Ok(Value::Tensor(out))
            }
            Node::Select(index) => {
                let [query, keys, values]: [Value; 3] = inputs.try_into().map_err(|v: Vec<_>| {
                    AdapterError::Forward(format!("select {id} expects 3 inputs, got {}", v.len()))
                })?;
                let pick = |pair: Value| -> Result<Value> {
                    pair.into_args().into_iter().nth(index.index()).ok_or_else(|| {
                        AdapterError::Forward(format!(
                            "select {id}: no entry at index {}",
                            index.index()
                        ))
                    })
                };
                Ok(Value::Tuple(vec![query, pick(keys)?, pick(values)?]))
            }
            Node::Multiply(factor) => {
                let xs = single_tensor(id, inputs)?;
                Ok(Value::Tensor((xs * *factor)?))
            }
            Node::UseContext(key) => ctx
                .get(key)
                .cloned()
                .map(Value::Tensor)
                .ok_or_else(|| AdapterError::Forward(format!("context key '{key}' is not set"))),
            Node::Identity => Ok(Value::from_args(inputs)),
        }
    }

    /// Convenience: evaluate `id` on a single tensor and expect a tensor.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward), plus [`AdapterError::Forward`]
    /// if the output is a tuple.
    pub fn forward_tensor(&self, id: NodeId, xs: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.forward(id, vec![Value::Tensor(xs.clone())], ctx)?
            .into_tensor()
    }

    /// Run `children` in sequence.
    fn forward_chain(
        &self,
        children: &[NodeId],
        inputs: Vec<Value>,
        ctx: &ForwardContext,
    ) -> Result<Value> {
        let mut args = inputs;
        for &child in children {
            args = self.forward(child, args, ctx)?.into_args();
        }
        Ok(Value::from_args(args))
    }
}

/// Exactly one tensor argument.
fn single_tensor(id: NodeId, inputs: Vec<Value>) -> Result<Tensor> {
    let [xs] = tensors::<1>(id, inputs)?;
    Ok(xs)
}

/// Exactly `N` tensor arguments.
fn tensors<const N: usize>(id: NodeId, inputs: Vec<Value>) -> Result<[Tensor; N]> {
    let got = inputs.len();
    let tensors = inputs
        .into_iter()
        .map(Value::into_tensor)
        .collect::<Result<Vec<_>>>()?;
    tensors
        .try_into()
        .map_err(|_| AdapterError::Forward(format!("{id} expects {N} tensor inputs, got {got}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::graph::{CrossAttnIndex, LinearParams};

    fn scalar_tensor(v: f32) -> Tensor {
        Tensor::new(&[[v]], &Device::Cpu).unwrap()
    }

    fn first(value: Value) -> f32 {
        value.into_tensor().unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn sum_of_parallel_branches() {
        let mut graph = Graph::new();
        let double = graph.add(Node::Multiply(2.0));
        let triple = graph.add(Node::Multiply(3.0));
        let sum = graph
            .container(ContainerKind::Sum, vec![double, triple])
            .unwrap();
        let out = graph
            .forward(sum, vec![scalar_tensor(1.5).into()], &ForwardContext::new())
            .unwrap();
        assert!((first(out) - 7.5).abs() < 1e-6);
    }

    #[test]
    fn distribute_routes_inputs_by_position() {
        let mut graph = Graph::new();
        let double = graph.add(Node::Multiply(2.0));
        let negate = graph.add(Node::Multiply(-1.0));
        let dist = graph
            .container(ContainerKind::Distribute, vec![double, negate])
            .unwrap();
        let out = graph
            .forward(
                dist,
                vec![scalar_tensor(1.0).into(), scalar_tensor(4.0).into()],
                &ForwardContext::new(),
            )
            .unwrap();
        let Value::Tuple(items) = out else {
            panic!("expected tuple")
        };
        let values: Vec<f32> = items.into_iter().map(first).collect();
        assert_eq!(values, vec![2.0, -4.0]);

        let err = graph.forward(dist, vec![scalar_tensor(1.0).into()], &ForwardContext::new());
        assert!(matches!(err, Err(AdapterError::Forward(_))));
    }

    #[test]
    fn chain_spreads_tuples_into_select() {
        let mut graph = Graph::new();
        let q = graph.add(Node::Identity);
        let kv = {
            let text = graph.add(Node::Multiply(1.0));
            let image = graph.add(Node::Multiply(10.0));
            graph
                .container(ContainerKind::Parallel, vec![text, image])
                .unwrap()
        };
        let kv2 = {
            let text = graph.add(Node::Multiply(1.0));
            let image = graph.add(Node::Multiply(100.0));
            graph
                .container(ContainerKind::Parallel, vec![text, image])
                .unwrap()
        };
        let dist = graph
            .container(ContainerKind::Distribute, vec![q, kv, kv2])
            .unwrap();
        let select = graph.add(Node::Select(CrossAttnIndex::Image));
        let chain = graph.chain(vec![dist, select]).unwrap();

        let inputs = vec![
            scalar_tensor(1.0).into(),
            scalar_tensor(1.0).into(),
            scalar_tensor(1.0).into(),
        ];
        let Value::Tuple(items) = graph.forward(chain, inputs, &ForwardContext::new()).unwrap()
        else {
            panic!("expected tuple")
        };
        let values: Vec<f32> = items.into_iter().map(first).collect();
        assert_eq!(values, vec![1.0, 10.0, 100.0]);
    }

    #[test]
    fn lora_scales_chain_output() {
        let mut graph = Graph::new();
        let weight = Tensor::new(&[[2f32]], &Device::Cpu).unwrap();
        let lin = graph.add(Node::Linear(LinearParams::new(weight, None)));
        let lora = graph
            .container(ContainerKind::Lora { scale: 0.5 }, vec![lin])
            .unwrap();
        let out = graph
            .forward_tensor(lora, &scalar_tensor(3.0), &ForwardContext::new())
            .unwrap();
        assert!((out.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn use_context_and_empty_injection_point() {
        let mut graph = Graph::new();
        let use_ctx = graph.add(Node::UseContext("clip_text_embedding".into()));
        let point = graph
            .container(ContainerKind::InjectionPoint, Vec::new())
            .unwrap();

        let mut ctx = ForwardContext::new();
        assert!(graph.forward(use_ctx, Vec::new(), &ctx).is_err());
        ctx.set("clip_text_embedding", scalar_tensor(5.0));
        assert!((first(graph.forward(use_ctx, Vec::new(), &ctx).unwrap()) - 5.0).abs() < 1e-6);

        let err = graph.forward_tensor(point, &scalar_tensor(1.0), &ctx);
        assert!(matches!(err, Err(AdapterError::Forward(_))));
    }

    #[test]
    fn reshape_keeps_batch_axis() {
        let mut graph = Graph::new();
        let reshape = graph.add(Node::Reshape(vec![2, 3]));
        let xs = Tensor::zeros((4, 6), DType::F32, &Device::Cpu).unwrap();
        let out = graph
            .forward_tensor(reshape, &xs, &ForwardContext::new())
            .unwrap();
        assert_eq!(out.dims(), &[4, 2, 3]);
    }
}
