// SPDX-License-Identifier: MIT OR Apache-2.0

//! Image-prompt adapter over a whole model.
//!
//! [`IPAdapter`] owns an [`ImageProjection`] and one
//! [`CrossAttentionAdapter`] per attention node of the target, except
//! plain self-attention. Sites are numbered in traversal order; that
//! ordinal is what `ip_adapter.NNN.` weight keys refer to.
//!
//! # Usage
//!
//! ```text
//! let mut adapter = IPAdapter::new(&mut graph, root, encoder, config, Some(&bundle))?;
//! adapter.inject(&mut graph, None)?;
//! let image = adapter.compute_clip_image_embedding(&graph, Some(&pixels))?;
//! let context = concat_context(&text, &image)?;   // [2, 77 + 4, 768]
//! ctx.set("context", context);
//! let out = graph.forward_tensor(graph.root().unwrap(), &latents, &ctx)?;
//! adapter.eject(&mut graph)?;
//! ```

use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;

use super::cross_attention::CrossAttentionAdapter;
use super::projection::ImageProjection;
use super::{Adapter, Binding};
use crate::config::IPAdapterConfig;
use crate::encoder::ImageEncoder;
use crate::error::{AdapterError, Result};
use crate::graph::{AttentionKind, Graph, Node, NodeId};
use crate::preprocess;
use crate::weights::{
    IMAGE_PROJ_PREFIX, IP_ADAPTER_PREFIX, adapter_ordinal, adapter_prefix, sub_bundle,
};

/// Top-level image-prompt adapter.
pub struct IPAdapter<E> {
    /// Link to the adapted model root; the adapter node is `Chain(target)`.
    binding: Binding,
    /// External vision encoder.
    encoder: E,
    /// Image embedding to pseudo-token projection.
    image_proj: ImageProjection,
    /// One per adapted attention site, in traversal order.
    sub_adapters: Vec<CrossAttentionAdapter>,
    /// Construction parameters.
    config: IPAdapterConfig,
    /// Placement of the target's parameters.
    device: Device,
    /// Precision of the target's parameters.
    dtype: DType,
}

impl<E> fmt::Debug for IPAdapter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IPAdapter")
            .field("binding", &self.binding)
            .field("image_proj", &self.image_proj)
            .field("sub_adapters", &self.sub_adapters.len())
            .field("config", &self.config)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl<E: ImageEncoder> IPAdapter<E> {
    /// Build adapters for every qualifying attention node under `target`
    /// and, if `weights` is given, load them.
    ///
    /// The live graph is not modified.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Config`](crate::AdapterError::Config) for an
    /// inconsistent `config`,
    /// [`AdapterError::Structure`](crate::AdapterError::Structure) if an
    /// attention site does not have the expected layout, and
    /// [`AdapterError::Shape`](crate::AdapterError::Shape) or
    /// [`AdapterError::Weights`](crate::AdapterError::Weights) if the
    /// bundle does not fit.
    pub fn new(
        graph: &mut Graph,
        target: NodeId,
        encoder: E,
        config: IPAdapterConfig,
        weights: Option<&HashMap<String, Tensor>>,
    ) -> Result<Self> {
        config.validate()?;
        let device = graph.device_of(target)?;
        let dtype = graph.dtype_of(target)?;

        let sites = graph.layers(target, is_adaptable_attention)?;
        let site_config = config.cross_attention();
        let sub_adapters = sites
            .into_iter()
            .map(|site| CrossAttentionAdapter::new(graph, site, site_config))
            .collect::<Result<Vec<_>>>()?;
        let image_proj = ImageProjection::new(graph, config.image_proj, &device, dtype)?;
        let node = graph.chain(vec![target])?;

        let adapter = Self {
            binding: Binding::new(target, node),
            encoder,
            image_proj,
            sub_adapters,
            config,
            device,
            dtype,
        };
        tracing::info!(
            sites = adapter.sub_adapters.len(),
            scale = adapter.config.scale,
            "built IP-Adapter"
        );
        if let Some(bundle) = weights {
            adapter.load_weights(graph, bundle)?;
        }
        Ok(adapter)
    }

    /// Route a checkpoint bundle to the projection and the per-site
    /// adapters.
    ///
    /// Keys outside `image_proj.` / `ip_adapter.NNN.`, and ordinals with no
    /// matching site, are ignored with a warning. Each component is loaded
    /// atomically; components are loaded in order, projection first.
    /// Returns the number of parameters written.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Shape`](crate::AdapterError::Shape) or
    /// [`AdapterError::Weights`](crate::AdapterError::Weights) if a
    /// component's sub-bundle does not fit it.
    pub fn load_weights(&self, graph: &mut Graph, bundle: &HashMap<String, Tensor>) -> Result<usize> {
        for key in bundle.keys() {
            if key.starts_with(IMAGE_PROJ_PREFIX) {
                continue;
            }
            match adapter_ordinal(key) {
                Some(ordinal) if ordinal < self.sub_adapters.len() => {}
                Some(ordinal) => {
                    tracing::warn!(
                        key = key.as_str(),
                        ordinal,
                        sites = self.sub_adapters.len(),
                        "ignoring weight for missing site"
                    );
                }
                None => {
                    tracing::warn!(key = key.as_str(), "ignoring weight with unrecognised prefix");
                }
            }
        }

        let mut written = 0;
        let proj = sub_bundle(bundle, IMAGE_PROJ_PREFIX);
        if !proj.is_empty() {
            written += self.image_proj.load_weights(graph, &proj)?;
        }
        for (ordinal, adapter) in self.sub_adapters.iter().enumerate() {
            let site = sub_bundle(bundle, &adapter_prefix(ordinal));
            if site.is_empty() {
                continue;
            }
            let count = adapter.load_weights(graph, &site)?;
            tracing::debug!(ordinal, count, "loaded per-site adapter weights");
            written += count;
        }
        tracing::info!(written, prefix = IP_ADAPTER_PREFIX, "loaded IP-Adapter weights");
        Ok(written)
    }

    /// Encode an image prompt and project it, paired with the projection of
    /// an all-zero embedding for classifier-free guidance.
    ///
    /// # Shapes
    /// - `image`: `[batch, 3, height, width]`
    /// - returns: `[2 * batch, sequence_length, clip_text_embedding_dim]`,
    ///   unconditional half first
    ///
    /// # Errors
    ///
    /// Propagates encoder failures, and returns
    /// [`AdapterError::Model`](crate::AdapterError::Model) if the embedding
    /// width does not match the projection.
    pub fn compute_clip_image_embedding(
        &self,
        graph: &Graph,
        image: Option<&Tensor>,
    ) -> Result<Tensor> {
        let embedding = self
            .encoder
            .encode(image)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let conditional = self.image_proj.forward(graph, &embedding)?;
        let negative = self.image_proj.forward(graph, &embedding.zeros_like()?)?;
        Ok(Tensor::cat(&[&negative, &conditional], 0)?)
    }

    /// [`preprocess::preprocess_image`] with this adapter's size and
    /// statistics, onto the target's device and precision.
    ///
    /// # Errors
    ///
    /// See [`preprocess::normalize`].
    pub fn preprocess_image(&self, image: &DynamicImage) -> Result<Tensor> {
        preprocess::preprocess_image(image, &self.config.preprocess, &self.device, self.dtype)
    }

    /// The projection module.
    #[must_use]
    pub const fn image_proj(&self) -> &ImageProjection {
        &self.image_proj
    }

    /// Per-site adapters, in ordinal order.
    #[must_use]
    pub fn sub_adapters(&self) -> &[CrossAttentionAdapter] {
        &self.sub_adapters
    }

    /// The vision encoder.
    #[must_use]
    pub const fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Construction parameters.
    #[must_use]
    pub const fn config(&self) -> &IPAdapterConfig {
        &self.config
    }

    /// Image-branch multiplier shared by every site.
    #[must_use]
    pub const fn scale(&self) -> f64 {
        self.config.scale
    }
}

impl<E: ImageEncoder> Adapter for IPAdapter<E> {
    fn target(&self) -> NodeId {
        self.binding.target()
    }

    fn node(&self) -> NodeId {
        self.binding.node()
    }

    fn is_injected(&self) -> bool {
        self.binding.is_injected()
    }

    /// Inject every per-site adapter, then substitute the wrapper for the
    /// target. If a site fails, the sites already injected are ejected
    /// again before the error is returned.
    fn inject(&mut self, graph: &mut Graph, parent: Option<NodeId>) -> Result<()> {
        let placement = self.binding.resolve_target(graph, parent)?;
        let mut done = 0;
        let mut failure = None;
        for adapter in &mut self.sub_adapters {
            if let Err(err) = adapter.inject(graph, None) {
                failure = Some(err);
                break;
            }
            done += 1;
        }
        if let Some(err) = failure {
            return Err(roll_back(graph, self.sub_adapters.iter_mut().take(done), err));
        }
        self.binding.substitute(graph, placement)?;
        tracing::info!(sites = self.sub_adapters.len(), "injected IP-Adapter");
        Ok(())
    }

    /// Restore the target first, then eject every per-site adapter.
    fn eject(&mut self, graph: &mut Graph) -> Result<()> {
        let placement = self.binding.resolve_node(graph)?;
        self.binding.restore(graph, placement)?;
        for adapter in &mut self.sub_adapters {
            adapter.eject(graph)?;
        }
        tracing::info!(sites = self.sub_adapters.len(), "ejected IP-Adapter");
        Ok(())
    }
}

/// Eject `injected` in reverse order after a failed injection and return
/// `err`. A failing eject is logged and the remaining sites are still
/// ejected.
fn roll_back<'a, I>(graph: &mut Graph, injected: I, err: AdapterError) -> AdapterError
where
    I: DoubleEndedIterator<Item = &'a mut CrossAttentionAdapter>,
{
    for adapter in injected.rev() {
        if let Err(rollback) = adapter.eject(graph) {
            tracing::warn!(
                site = %adapter.target(),
                error = %rollback,
                "failed to eject site while rolling back injection"
            );
        }
    }
    err
}

/// Attention nodes other than plain self-attention.
fn is_adaptable_attention(node: &Node) -> bool {
    node.attention_meta()
        .is_some_and(|meta| meta.kind != AttentionKind::SelfAttention)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{AttentionConfig, ImageProjectionConfig};
    use crate::layers::{attention, fresh_var_builder};

    fn config() -> IPAdapterConfig {
        IPAdapterConfig {
            image_proj: ImageProjectionConfig {
                clip_image_embedding_dim: 6,
                clip_text_embedding_dim: 4,
                sequence_length: 2,
            },
            text_sequence_length: 3,
            image_sequence_length: 2,
            ..IPAdapterConfig::default()
        }
    }

    fn encoder(_: Option<&Tensor>) -> Result<Tensor> {
        Ok(Tensor::ones((1, 6), DType::F32, &Device::Cpu)?)
    }

    /// Root chain: self-attention, cross-attention, 2D self-attention.
    fn model(graph: &mut Graph) -> NodeId {
        let (_varmap, vb) = fresh_var_builder(DType::F32, &Device::Cpu);
        let sa = attention::self_attention(graph, &AttentionConfig::self_attention(8, 2), vb.pp("sa"))
            .unwrap();
        let ca = attention::load(graph, &AttentionConfig::cross_attention(8, 4, 2), vb.pp("ca"))
            .unwrap();
        let block = attention::cross_attention_block(graph, ca, "context").unwrap();
        let sa2d = attention::self_attention_2d(
            graph,
            &AttentionConfig::self_attention(8, 2),
            vb.pp("sa2d"),
        )
        .unwrap();
        let root = graph.chain(vec![sa, block, sa2d]).unwrap();
        graph.set_root(root).unwrap();
        root
    }

    #[test]
    fn plain_self_attention_is_skipped() {
        let mut graph = Graph::new();
        let root = model(&mut graph);
        let adapter = IPAdapter::new(&mut graph, root, encoder, config(), None).unwrap();
        let kinds: Vec<AttentionKind> = adapter
            .sub_adapters()
            .iter()
            .map(|a| a.meta().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![AttentionKind::Attention, AttentionKind::SelfAttention2d]
        );
    }

    #[test]
    fn inject_eject_round_trip() {
        let mut graph = Graph::new();
        let root = model(&mut graph);
        let before = graph.subtree(root).unwrap();
        let mut adapter = IPAdapter::new(&mut graph, root, encoder, config(), None).unwrap();

        adapter.inject(&mut graph, None).unwrap();
        assert_eq!(graph.root(), Some(adapter.node()));
        assert!(adapter.sub_adapters().iter().all(Adapter::is_injected));
        for site in adapter.sub_adapters() {
            assert!(graph.is_live(site.node()));
            assert!(!graph.is_live(site.target()));
        }

        adapter.eject(&mut graph).unwrap();
        assert_eq!(graph.root(), Some(root));
        assert_eq!(graph.subtree(root).unwrap(), before);
        assert!(!adapter.sub_adapters().iter().any(Adapter::is_injected));
    }

    #[test]
    fn failed_site_rolls_back_earlier_sites() {
        let mut graph = Graph::new();
        let root = model(&mut graph);
        let before = graph.subtree(root).unwrap();
        let mut adapter = IPAdapter::new(&mut graph, root, encoder, config(), None).unwrap();
        let second = adapter.sub_adapters()[1].node();
        let point = crate::injection_points(&graph, second).unwrap()[0];
        let squatter = graph.add(Node::Identity);
        crate::attach(&mut graph, point, squatter).unwrap();

        let err = adapter.inject(&mut graph, None).unwrap_err();
        assert!(matches!(err, AdapterError::Structure(_)));
        assert!(!adapter.is_injected());
        assert!(!adapter.sub_adapters().iter().any(Adapter::is_injected));
        assert_eq!(graph.root(), Some(root));
        assert_eq!(graph.subtree(root).unwrap(), before);
    }

    #[test]
    fn rollback_failure_keeps_the_injection_error() {
        let mut graph = Graph::new();
        let root = model(&mut graph);
        let mut adapter = IPAdapter::new(&mut graph, root, encoder, config(), None).unwrap();
        let original = AdapterError::Structure("site 1 could not be injected".to_owned());

        // Nothing is injected, so every eject in the rollback fails.
        let err = roll_back(&mut graph, adapter.sub_adapters.iter_mut(), original);
        assert!(
            matches!(err, AdapterError::Structure(ref msg) if msg == "site 1 could not be injected")
        );
    }

    #[test]
    fn embedding_is_negative_then_conditional() {
        let mut graph = Graph::new();
        let root = model(&mut graph);
        let adapter = IPAdapter::new(&mut graph, root, encoder, config(), None).unwrap();
        let out = adapter.compute_clip_image_embedding(&graph, None).unwrap();
        assert_eq!(out.dims(), &[2, 2, 4]);

        let zeros = Tensor::zeros((1, 6), DType::F32, &Device::Cpu).unwrap();
        let ones = Tensor::ones((1, 6), DType::F32, &Device::Cpu).unwrap();
        let negative = adapter.image_proj().forward(&graph, &zeros).unwrap();
        let conditional = adapter.image_proj().forward(&graph, &ones).unwrap();
        let diff = |a: &Tensor, b: &Tensor| -> f32 {
            (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
        };
        assert!(diff(&out.narrow(0, 0, 1).unwrap(), &negative) < 1e-6);
        assert!(diff(&out.narrow(0, 1, 1).unwrap(), &conditional) < 1e-6);
    }

    #[test]
    fn inconsistent_config_is_rejected() {
        let mut graph = Graph::new();
        let root = model(&mut graph);
        let mut bad = config();
        bad.image_sequence_length = 3;
        assert!(IPAdapter::new(&mut graph, root, encoder, bad, None).is_err());
    }

    #[test]
    fn unknown_prefixes_are_ignored() {
        let mut graph = Graph::new();
        let root = model(&mut graph);
        let mut bundle = HashMap::new();
        bundle.insert(
            "text_encoder.weight".to_owned(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        );
        bundle.insert(
            "ip_adapter.009.Distribute.Parallel_1.Chain_2.Linear.weight".to_owned(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        );
        let adapter = IPAdapter::new(&mut graph, root, encoder, config(), None).unwrap();
        assert_eq!(adapter.load_weights(&mut graph, &bundle).unwrap(), 0);
    }
}
