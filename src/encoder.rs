// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vision-encoder contract.

use candle_core::Tensor;

use crate::error::Result;

/// Maps a preprocessed image to a fixed-width embedding.
///
/// The image tensor is `[batch, 3, height, width]` as produced by
/// [`preprocess_image`](crate::preprocess::preprocess_image). `None` asks
/// the encoder for its embedding of an absent prompt; what that means is
/// up to the encoder.
///
/// Any `Fn(Option<&Tensor>) -> Result<Tensor>` closure is an encoder.
pub trait ImageEncoder {
    /// Encode `image`.
    ///
    /// # Shapes
    /// - `image`: `[batch, 3, height, width]`
    /// - returns: `[batch, clip_image_embedding_dim]`
    ///
    /// # Errors
    ///
    /// Whatever the encoder reports.
    fn encode(&self, image: Option<&Tensor>) -> Result<Tensor>;
}

impl<F> ImageEncoder for F
where
    F: Fn(Option<&Tensor>) -> Result<Tensor>,
{
    fn encode(&self, image: Option<&Tensor>) -> Result<Tensor> {
        self(image)
    }
}
