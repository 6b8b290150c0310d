// SPDX-License-Identifier: MIT OR Apache-2.0

//! Image-to-tensor conversion and per-channel normalization.
//!
//! [`preprocess_image`] is the usual entry point: resize, convert to a
//! `[1, 3, H, W]` tensor in `[0, 1]`, then normalize with CLIP statistics.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use image::imageops::FilterType;

use crate::config::PreprocessConfig;
use crate::error::{AdapterError, Result};

/// Decode an image file.
///
/// # Errors
///
/// Returns [`AdapterError::Image`] if the file cannot be read or decoded.
pub fn open_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    Ok(image::open(path)?)
}

/// Convert an image to an RGB tensor scaled to `[0, 1]`.
///
/// # Shapes
/// - returns: `[1, 3, height, width]`
///
/// # Errors
///
/// Returns [`AdapterError::Model`] on tensor construction failure.
pub fn image_to_tensor(image: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    #[allow(clippy::as_conversions)] // u32 -> usize is lossless on supported targets
    let (width, height) = (width as usize, height as usize);
    let pixels = Tensor::from_vec(rgb.into_raw(), (height, width, 3), device)?;
    // [H, W, C] -> [1, C, H, W]
    let chw = pixels.permute((2, 0, 1))?.unsqueeze(0)?;
    Ok((chw.to_dtype(DType::F32)? / 255.0)?.to_dtype(dtype)?)
}

/// Return `(x - mean[c]) / std[c]` for every channel `c` of a
/// `[..., C, H, W]` tensor. The input is not modified.
///
/// # Errors
///
/// Returns [`AdapterError::Domain`] if a `std` component is zero at the
/// tensor's precision (checked before any arithmetic), and
/// [`AdapterError::Config`] if the tensor is not floating point, has rank
/// below 3, or `mean` and `std` lengths disagree with each other or with
/// the channel axis.
pub fn normalize(xs: &Tensor, mean: &[f32], std: &[f32]) -> Result<Tensor> {
    if !xs.dtype().is_float() {
        return Err(AdapterError::Config(format!(
            "cannot normalize a {:?} tensor",
            xs.dtype()
        )));
    }
    let rank = xs.rank();
    if rank < 3 {
        return Err(AdapterError::Config(format!(
            "normalize expects [..., C, H, W], got rank {rank}"
        )));
    }
    if mean.len() != std.len() {
        return Err(AdapterError::Config(format!(
            "mean has {} channels but std has {}",
            mean.len(),
            std.len()
        )));
    }
    let channels = xs.dim(rank - 3)?;
    if channels != mean.len() {
        return Err(AdapterError::Config(format!(
            "tensor has {channels} channels but mean/std have {}",
            mean.len()
        )));
    }

    // Check at the tensor's precision: a tiny f32 std can round to zero in f16.
    let device = xs.device();
    let std = Tensor::new(std, device)?.to_dtype(xs.dtype())?;
    let rounded = std.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    #[allow(clippy::float_cmp)] // exact zero is the failure condition
    let zero_channel = rounded.iter().position(|s| *s == 0.0);
    if let Some(channel) = zero_channel {
        return Err(AdapterError::Domain(format!(
            "std of channel {channel} is zero"
        )));
    }
    let mean = Tensor::new(mean, device)?.to_dtype(xs.dtype())?;

    let stat_shape = (channels, 1, 1);
    let mean = mean.reshape(stat_shape)?;
    let std = std.reshape(stat_shape)?;
    Ok(xs.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

/// [`normalize`] replacing `xs` with the result. On error `xs` is left
/// untouched.
///
/// # Errors
///
/// Same as [`normalize`].
pub fn normalize_in_place(xs: &mut Tensor, mean: &[f32], std: &[f32]) -> Result<()> {
    *xs = normalize(xs, mean, std)?;
    Ok(())
}

/// Resize to `config.size` with bicubic filtering, convert to a tensor, and
/// normalize with `config.mean` / `config.std`.
///
/// # Shapes
/// - returns: `[1, 3, config.size.1, config.size.0]`
///
/// # Errors
///
/// Same as [`normalize`].
pub fn preprocess_image(
    image: &DynamicImage,
    config: &PreprocessConfig,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let (width, height) = config.size;
    let resized = image.resize_exact(width, height, FilterType::CatmullRom);
    let xs = image_to_tensor(&resized, device, dtype)?;
    normalize(&xs, &config.mean, &config.std)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
