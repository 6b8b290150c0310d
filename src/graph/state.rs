// SPDX-License-Identifier: MIT OR Apache-2.0

//! State-dict naming and parameter loading.
//!
//! Keys are built from kind names: a child is called by its
//! [`type_name`](super::Node::type_name), suffixed `_k` (1-based) when
//! several siblings share that name. Leaf parameters are `weight` and
//! `bias`. For example, the image-key projection of a cross-attention
//! adapter lives at `Distribute.Parallel_1.Chain_2.Linear.weight`.
//!
//! Keys stop at injection points. An occupied point holds a node owned by
//! another part of the graph, so that node's parameters are neither listed
//! nor writable through the point's ancestors.

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;

use super::{Graph, Node, NodeId};
use crate::error::{AdapterError, Result};

impl Graph {
    /// Names of the children of `parent`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if a node is unknown.
    pub fn child_names(&self, parent: NodeId) -> Result<Vec<(String, NodeId)>> {
        let children = self.children(parent)?;
        let names = children
            .iter()
            .map(|&c| self.node(c).map(Node::type_name))
            .collect::<Result<Vec<_>>>()?;

        let mut totals: HashMap<&str, usize> = HashMap::new();
        for name in &names {
            *totals.entry(*name).or_default() += 1;
        }
        let mut seen: HashMap<&str, usize> = HashMap::new();
        Ok(names
            .iter()
            .zip(children)
            .map(|(name, &child)| {
                let n = seen.entry(*name).or_default();
                *n += 1;
                let label = if totals.get(name).copied().unwrap_or(0) > 1 {
                    format!("{name}_{n}")
                } else {
                    (*name).to_owned()
                };
                (label, child)
            })
            .collect())
    }

    /// Named children whose parameters belong to `id`: empty for an
    /// injection point, [`child_names`](Self::child_names) otherwise.
    fn owned_children(&self, id: NodeId) -> Result<Vec<(String, NodeId)>> {
        if self.node(id)?.is_injection_point() {
            return Ok(Vec::new());
        }
        self.child_names(id)
    }

    /// Every parameter under `id`, keyed relative to `id`. Contents of
    /// injection points are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Structure`] if a node is unknown.
    pub fn state_dict(&self, id: NodeId) -> Result<BTreeMap<String, Tensor>> {
        let mut out = BTreeMap::new();
        self.collect_state(id, "", &mut out)?;
        Ok(out)
    }

    /// Recursive helper for [`state_dict`](Self::state_dict).
    fn collect_state(
        &self,
        id: NodeId,
        prefix: &str,
        out: &mut BTreeMap<String, Tensor>,
    ) -> Result<()> {
        for (name, tensor) in self.node(id)?.parameters() {
            out.insert(join(prefix, name), tensor.clone());
        }
        for (name, child) in self.owned_children(id)? {
            self.collect_state(child, &join(prefix, &name), out)?;
        }
        Ok(())
    }

    /// Resolve a state-dict key to `(leaf, parameter name)`.
    fn resolve(&self, id: NodeId, key: &str) -> Result<(NodeId, String)> {
        let unknown = || AdapterError::Weights(format!("no parameter named '{key}' under {id}"));
        let mut segments: Vec<&str> = key.split('.').collect();
        let param = segments.pop().ok_or_else(unknown)?;
        let mut current = id;
        for segment in segments {
            current = self
                .owned_children(current)?
                .into_iter()
                .find(|(name, _)| name == segment)
                .map(|(_, child)| child)
                .ok_or_else(unknown)?;
        }
        let exists = self
            .node(current)?
            .parameters()
            .iter()
            .any(|(name, _)| *name == param);
        if exists {
            Ok((current, param.to_owned()))
        } else {
            Err(unknown())
        }
    }

    /// Overwrite parameters under `id` with tensors from `bundle`.
    ///
    /// Every key is checked before any parameter is written, so a failed
    /// load leaves the graph untouched. Tensors are moved to the device and
    /// precision of the parameter they replace. Parameters absent from the
    /// bundle keep their values. Returns the number of parameters written.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Weights`] for a key naming no parameter
    /// (including one reached through an injection point) and
    /// [`AdapterError::Shape`] when a tensor's dims differ from the target's.
    pub fn load_state_dict(&mut self, id: NodeId, bundle: &HashMap<String, Tensor>) -> Result<usize> {
        let mut keys: Vec<&String> = bundle.keys().collect();
        keys.sort();

        let mut writes = Vec::with_capacity(keys.len());
        for key in keys {
            let (leaf, param) = self.resolve(id, key)?;
            let current = self
                .node(leaf)?
                .parameters()
                .into_iter()
                .find(|(name, _)| *name == param)
                .map(|(_, t)| t.clone())
                .ok_or_else(|| AdapterError::Weights(format!("no parameter named '{key}'")))?;
            let Some(tensor) = bundle.get(key) else {
                continue;
            };
            if tensor.dims() != current.dims() {
                return Err(AdapterError::Shape {
                    key: key.clone(),
                    expected: current.dims().to_vec(),
                    actual: tensor.dims().to_vec(),
                });
            }
            let tensor = tensor
                .to_device(current.device())?
                .to_dtype(current.dtype())?;
            writes.push((leaf, param, tensor));
        }

        let count = writes.len();
        for (leaf, param, tensor) in writes {
            let slot = self
                .node_mut(leaf)?
                .parameter_mut(&param)
                .ok_or_else(|| AdapterError::Weights(format!("no parameter named '{param}'")))?;
            *slot = tensor;
        }
        Ok(count)
    }
}

/// Join a key prefix and a segment with `.`.
fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
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
    use crate::adapter::injection::{attach, injection_point};
    use crate::graph::{ContainerKind, LinearParams};

    fn linear(graph: &mut Graph, bias: bool) -> NodeId {
        let weight = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let bias = bias.then(|| Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        graph.add(Node::Linear(LinearParams::new(weight, bias)))
    }

    /// `Chain[Linear(bias), Parallel[Chain[Slicing], Chain[Linear]]]`
    fn sample() -> (Graph, NodeId) {
        let mut graph = Graph::new();
        let top = linear(&mut graph, true);
        let slicing = graph.add(Node::Slicing {
            dim: 1,
            start: 0,
            length: 1,
        });
        let a = graph.chain(vec![slicing]).unwrap();
        let inner = linear(&mut graph, false);
        let b = graph.chain(vec![inner]).unwrap();
        let parallel = graph
            .container(ContainerKind::Parallel, vec![a, b])
            .unwrap();
        let root = graph.chain(vec![top, parallel]).unwrap();
        (graph, root)
    }

    #[test]
    fn names_are_suffixed_only_when_ambiguous() {
        let (graph, root) = sample();
        let keys: Vec<String> = graph.state_dict(root).unwrap().into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "Linear.bias".to_owned(),
                "Linear.weight".to_owned(),
                "Parallel.Chain_2.Linear.weight".to_owned(),
            ]
        );
    }

    #[test]
    fn load_overwrites_named_parameter() {
        let (mut graph, root) = sample();
        let ones = Tensor::ones((2, 3), DType::F64, &Device::Cpu).unwrap();
        let bundle = HashMap::from([("Parallel.Chain_2.Linear.weight".to_owned(), ones)]);
        assert_eq!(graph.load_state_dict(root, &bundle).unwrap(), 1);

        let state = graph.state_dict(root).unwrap();
        let loaded = &state["Parallel.Chain_2.Linear.weight"];
        assert_eq!(loaded.dtype(), DType::F32);
        let sum: f32 = loaded.sum_all().unwrap().to_scalar().unwrap();
        assert!((sum - 6.0).abs() < 1e-6);
        let untouched: f32 = state["Linear.weight"].sum_all().unwrap().to_scalar().unwrap();
        assert!(untouched.abs() < 1e-6);
    }

    #[test]
    fn shape_mismatch_aborts_whole_load() {
        let (mut graph, root) = sample();
        let good = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let bad = Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap();
        let bundle = HashMap::from([
            ("Linear.weight".to_owned(), good),
            ("Parallel.Chain_2.Linear.weight".to_owned(), bad),
        ]);
        let err = graph.load_state_dict(root, &bundle).unwrap_err();
        assert!(matches!(err, AdapterError::Shape { ref key, .. } if key == "Parallel.Chain_2.Linear.weight"));

        let state = graph.state_dict(root).unwrap();
        let untouched: f32 = state["Linear.weight"].sum_all().unwrap().to_scalar().unwrap();
        assert!(untouched.abs() < 1e-6);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (mut graph, root) = sample();
        let t = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        for key in ["Linear.scale", "Parallel.Chain_3.Linear.weight", "Parallel.Chain_2.Linear.bias"] {
            let bundle = HashMap::from([(key.to_owned(), t.clone())]);
            assert!(matches!(
                graph.load_state_dict(root, &bundle),
                Err(AdapterError::Weights(_))
            ));
        }
    }

    #[test]
    fn injection_point_contents_are_not_addressable() {
        let (mut graph, root) = sample();
        let point = injection_point(&mut graph);
        let borrowed = linear(&mut graph, true);
        attach(&mut graph, point, borrowed).unwrap();
        graph.push_child(root, point).unwrap();

        let keys: Vec<String> = graph.state_dict(root).unwrap().into_keys().collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| !k.starts_with("InjectionPoint")));

        let ones = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let bundle = HashMap::from([("InjectionPoint.Linear.weight".to_owned(), ones)]);
        assert!(matches!(
            graph.load_state_dict(root, &bundle),
            Err(AdapterError::Weights(_))
        ));
        let weight = &graph.state_dict(borrowed).unwrap()["weight"];
        let sum: f32 = weight.sum_all().unwrap().to_scalar().unwrap();
        assert!(sum.abs() < 1e-6);
    }
}
