// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-ip-adapter.

/// Errors that can occur while building, splicing, or running adapters.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Tensor operation failure (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// The target graph does not have the shape an adapter expects
    /// (wrong number of matched leaves, splice point in the wrong state,
    /// unknown node, node not attached where expected).
    #[error("structure error: {0}")]
    Structure(String),

    /// A loaded tensor disagrees with the shape of the parameter it targets.
    #[error("shape mismatch for `{key}`: expected {expected:?}, got {actual:?}")]
    Shape {
        /// Parameter key, relative to the node the bundle was loaded into.
        key: String,
        /// Shape of the existing parameter.
        expected: Vec<usize>,
        /// Shape of the supplied tensor.
        actual: Vec<usize>,
    },

    /// A weight bundle key does not name any parameter.
    #[error("weights error: {0}")]
    Weights(String),

    /// Evaluation failure: wrong arity, missing context tensor, empty
    /// splice point on the forward path.
    #[error("forward error: {0}")]
    Forward(String),

    /// Input-dependent numeric domain violation (e.g. zero `std`).
    #[error("domain error: {0}")]
    Domain(String),

    /// Configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// Image decoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-ip-adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;
