// SPDX-License-Identifier: MIT OR Apache-2.0

//! Image embedding to pseudo-token projection.
//!
//! `Chain(Linear, Reshape, LayerNorm)`: one linear map widens the image
//! embedding to `sequence_length * clip_text_embedding_dim`, the result is
//! cut into `sequence_length` tokens, and each token is layer-normalized.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::config::ImageProjectionConfig;
use crate::error::Result;
use crate::graph::{ForwardContext, Graph, Node, NodeId};
use crate::layers::{LAYER_NORM_EPS, fresh_var_builder, layer_norm, linear};

/// Projection of one image embedding into the text-embedding space.
#[derive(Debug, Clone)]
pub struct ImageProjection {
    /// Root of the projection subgraph (detached from the live graph).
    node: NodeId,
    /// Sizes the projection was built with.
    config: ImageProjectionConfig,
}

impl ImageProjection {
    /// Build a freshly initialised projection in `graph`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Model`](crate::AdapterError::Model) if
    /// parameter initialisation fails.
    pub fn new(
        graph: &mut Graph,
        config: ImageProjectionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (_varmap, vb) = fresh_var_builder(dtype, device);
        let text_dim = config.clip_text_embedding_dim;

        let proj = linear(
            graph,
            config.clip_image_embedding_dim,
            text_dim * config.sequence_length,
            true,
            vb.pp("proj"),
        )?;
        let reshape = graph.add(Node::Reshape(vec![config.sequence_length, text_dim]));
        let norm = layer_norm(graph, text_dim, LAYER_NORM_EPS, vb.pp("norm"))?;
        let node = graph.chain(vec![proj, reshape, norm])?;
        Ok(Self { node, config })
    }

    /// Project a batch of image embeddings.
    ///
    /// # Shapes
    /// - `image_embedding`: `[batch, clip_image_embedding_dim]`
    /// - returns: `[batch, sequence_length, clip_text_embedding_dim]`
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Model`](crate::AdapterError::Model) on a
    /// width mismatch.
    pub fn forward(&self, graph: &Graph, image_embedding: &Tensor) -> Result<Tensor> {
        graph.forward_tensor(self.node, image_embedding, &ForwardContext::new())
    }

    /// Overwrite parameters from a bundle keyed like `Linear.weight`.
    ///
    /// # Errors
    ///
    /// See [`Graph::load_state_dict`].
    pub fn load_weights(&self, graph: &mut Graph, bundle: &HashMap<String, Tensor>) -> Result<usize> {
        graph.load_state_dict(self.node, bundle)
    }

    /// Root node of the projection.
    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    /// Sizes.
    #[must_use]
    pub const fn config(&self) -> &ImageProjectionConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::AdapterError;

    fn small_config() -> ImageProjectionConfig {
        ImageProjectionConfig {
            clip_image_embedding_dim: 6,
            clip_text_embedding_dim: 4,
            sequence_length: 3,
        }
    }

    #[test]
    fn output_shape_is_tokens_by_text_dim() {
        let mut graph = Graph::new();
        let proj = ImageProjection::new(&mut graph, small_config(), &Device::Cpu, DType::F32)
            .unwrap();
        let emb = Tensor::randn(0f32, 1.0, (2, 6), &Device::Cpu).unwrap();
        let out = proj.forward(&graph, &emb).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);

        // Each token is normalized on its own.
        let means = out.mean_keepdim(2).unwrap().abs().unwrap();
        let worst: f32 = means.max_all().unwrap().to_scalar().unwrap();
        assert!(worst < 1e-4);
    }

    #[test]
    fn state_dict_keys() {
        let mut graph = Graph::new();
        let proj = ImageProjection::new(&mut graph, small_config(), &Device::Cpu, DType::F32)
            .unwrap();
        let keys: Vec<String> = graph.state_dict(proj.node()).unwrap().into_keys().collect();
        assert_eq!(
            keys,
            vec!["LayerNorm.bias", "LayerNorm.weight", "Linear.bias", "Linear.weight"]
        );
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let mut graph = Graph::new();
        let proj = ImageProjection::new(&mut graph, small_config(), &Device::Cpu, DType::F32)
            .unwrap();
        let mut bundle = HashMap::new();
        bundle.insert(
            "Linear.weight".to_owned(),
            Tensor::zeros((5, 6), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = proj.load_weights(&mut graph, &bundle).unwrap_err();
        assert!(matches!(err, AdapterError::Shape { .. }));
    }

    #[test]
    fn input_width_mismatch_fails() {
        let mut graph = Graph::new();
        let proj = ImageProjection::new(&mut graph, small_config(), &Device::Cpu, DType::F32)
            .unwrap();
        let emb = Tensor::zeros((1, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(proj.forward(&graph, &emb).is_err());
    }
}
