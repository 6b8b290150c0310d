// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-ip-adapter
//!
//! Image-prompt conditioning for pretrained attention models, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! An [`IPAdapter`] is spliced into an existing model graph without
//! touching any of its parameters. Every cross-attention site is replaced
//! by a [`CrossAttentionAdapter`] that reuses the site's own query, key,
//! value and output projections for the text part of the context and adds
//! new key/value projections for image pseudo-tokens produced by an
//! [`ImageProjection`]. [`Adapter::eject`] restores the original graph
//! node for node.
//!
//! ## Modules
//!
//! - [`graph`]: arena computation graph with containers, leaves, traversal,
//!   evaluation, state-dict naming.
//! - [`layers`]: builders for linear, layer-norm, attention and LoRA nodes.
//! - [`adapter`]: injection points and the adapters themselves.
//! - [`preprocess`]: image loading, resizing, normalization.
//! - [`weights`]: checkpoint prefix routing and safetensors loading.

#![warn(missing_docs)]

pub mod adapter;
pub mod config;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod layers;
pub mod preprocess;
pub mod weights;

pub use adapter::cross_attention::CrossAttentionAdapter;
pub use adapter::injection::{attach, detach, injection_point, injection_points};
pub use adapter::ip_adapter::IPAdapter;
pub use adapter::projection::ImageProjection;
pub use adapter::{Adapter, concat_context};
pub use config::{
    AttentionConfig, CLIP_MEAN, CLIP_STD, CrossAttentionConfig, IPAdapterConfig,
    ImageProjectionConfig, PreprocessConfig,
};
pub use encoder::ImageEncoder;
pub use error::{AdapterError, Result};
pub use graph::{
    AttentionKind, AttentionMeta, ContainerKind, CrossAttnIndex, ForwardContext, Graph, Node,
    NodeId, Value, Visit,
};
