// SPDX-License-Identifier: MIT OR Apache-2.0

//! Construction parameters and JSON config parsing.
//!
//! Every adapter component takes a small `Copy`/`Clone` config struct whose
//! [`Default`] matches the IP-Adapter reference sizes (CLIP ViT-H image
//! embeddings projected into an SD 1.x text-embedding space).
//! [`IPAdapterConfig::from_json`] reads the same values from a JSON object,
//! falling back to the defaults for absent keys.
//!
//! # Usage
//!
//! ```
//! use candle_ip_adapter::IPAdapterConfig;
//!
//! let json = serde_json::json!({"scale": 0.6, "image_sequence_length": 16,
//!     "sequence_length": 16});
//! let config = IPAdapterConfig::from_json(&json).unwrap();
//! assert_eq!(config.image_sequence_length, 16);
//! assert_eq!(config.text_sequence_length, 77);
//! ```

use serde_json::Value;

use crate::error::{AdapterError, Result};

/// CLIP image normalization mean (per RGB channel).
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP image normalization standard deviation (per RGB channel).
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

// ---------------------------------------------------------------------------
// Component configs
// ---------------------------------------------------------------------------

/// Sizes of the [`ImageProjection`](crate::ImageProjection) module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProjectionConfig {
    /// Width of one CLIP image embedding.
    pub clip_image_embedding_dim: usize,
    /// Width of one CLIP text token embedding.
    pub clip_text_embedding_dim: usize,
    /// Number of pseudo-tokens produced per image.
    pub sequence_length: usize,
}

impl Default for ImageProjectionConfig {
    fn default() -> Self {
        Self {
            clip_image_embedding_dim: 1024,
            clip_text_embedding_dim: 768,
            sequence_length: 4,
        }
    }
}

/// Per-site parameters of a [`CrossAttentionAdapter`](crate::CrossAttentionAdapter).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossAttentionConfig {
    /// Number of text positions at the front of the context.
    pub text_sequence_length: usize,
    /// Number of image pseudo-token positions following the text.
    pub image_sequence_length: usize,
    /// Multiplier applied to the image-attention branch.
    pub scale: f64,
}

impl Default for CrossAttentionConfig {
    fn default() -> Self {
        Self {
            text_sequence_length: 77,
            image_sequence_length: 4,
            scale: 1.0,
        }
    }
}

/// Image preprocessing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    /// Target `(width, height)` after resizing.
    pub size: (u32, u32),
    /// Per-channel mean subtracted after scaling to `[0, 1]`.
    pub mean: Vec<f32>,
    /// Per-channel standard deviation divided out after the mean.
    pub std: Vec<f32>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            size: (224, 224),
            mean: CLIP_MEAN.to_vec(),
            std: CLIP_STD.to_vec(),
        }
    }
}

/// Shape of an attention node built by [`layers::attention`](crate::layers::attention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionConfig {
    /// Width of the query input (and of the output projection).
    pub embedding_dim: usize,
    /// Width of the key input.
    pub key_embedding_dim: usize,
    /// Width of the value input.
    pub value_embedding_dim: usize,
    /// Width of the projected query/key/value space.
    pub inner_dim: usize,
    /// Number of attention heads; must divide `inner_dim`.
    pub num_heads: usize,
    /// Whether to apply a causal mask.
    pub is_causal: bool,
    /// Whether the query/key/value projections carry a bias.
    pub use_bias: bool,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 320,
            key_embedding_dim: 768,
            value_embedding_dim: 768,
            inner_dim: 320,
            num_heads: 8,
            is_causal: false,
            use_bias: false,
        }
    }
}

impl AttentionConfig {
    /// Self-attention config: key and value widths equal the query width.
    #[must_use]
    pub fn self_attention(embedding_dim: usize, num_heads: usize) -> Self {
        Self {
            embedding_dim,
            key_embedding_dim: embedding_dim,
            value_embedding_dim: embedding_dim,
            inner_dim: embedding_dim,
            num_heads,
            ..Self::default()
        }
    }

    /// Cross-attention config reading keys and values from a context of
    /// width `context_dim`.
    #[must_use]
    pub fn cross_attention(embedding_dim: usize, context_dim: usize, num_heads: usize) -> Self {
        Self {
            embedding_dim,
            key_embedding_dim: context_dim,
            value_embedding_dim: context_dim,
            inner_dim: embedding_dim,
            num_heads,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// IPAdapterConfig
// ---------------------------------------------------------------------------

/// Full configuration surface of an [`IPAdapter`](crate::IPAdapter).
#[derive(Debug, Clone, PartialEq)]
pub struct IPAdapterConfig {
    /// Projection module sizes.
    pub image_proj: ImageProjectionConfig,
    /// Text positions at the front of every context tensor.
    pub text_sequence_length: usize,
    /// Image positions following the text in every context tensor.
    pub image_sequence_length: usize,
    /// Image-branch multiplier shared by all per-site adapters.
    pub scale: f64,
    /// Preprocessing defaults for [`IPAdapter::preprocess_image`](crate::IPAdapter::preprocess_image).
    pub preprocess: PreprocessConfig,
}

impl Default for IPAdapterConfig {
    fn default() -> Self {
        let cross = CrossAttentionConfig::default();
        Self {
            image_proj: ImageProjectionConfig::default(),
            text_sequence_length: cross.text_sequence_length,
            image_sequence_length: cross.image_sequence_length,
            scale: cross.scale,
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl IPAdapterConfig {
    /// Parse from a JSON object. Absent keys keep their defaults; present
    /// keys with the wrong type are errors.
    ///
    /// Recognised keys: `clip_image_embedding_dim`, `clip_text_embedding_dim`,
    /// `sequence_length`, `text_sequence_length`, `image_sequence_length`,
    /// `scale`, `image_size` (`[width, height]`), `image_mean`, `image_std`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Config`] if the value is not an object, a
    /// field has the wrong type, or the result fails [`validate`](Self::validate).
    pub fn from_json(config: &Value) -> Result<Self> {
        if !config.is_object() {
            return Err(AdapterError::Config(
                "adapter config must be a JSON object".into(),
            ));
        }
        let defaults = Self::default();

        let image_proj = ImageProjectionConfig {
            clip_image_embedding_dim: get_usize_or(
                config,
                "clip_image_embedding_dim",
                defaults.image_proj.clip_image_embedding_dim,
            )?,
            clip_text_embedding_dim: get_usize_or(
                config,
                "clip_text_embedding_dim",
                defaults.image_proj.clip_text_embedding_dim,
            )?,
            sequence_length: get_usize_or(
                config,
                "sequence_length",
                defaults.image_proj.sequence_length,
            )?,
        };

        let size = match config.get("image_size") {
            None => defaults.preprocess.size,
            Some(value) => {
                let dims = get_f32_list(value, "image_size")?;
                match dims.as_slice() {
                    [w, h] if *w >= 1.0 && *h >= 1.0 && w.fract() == 0.0 && h.fract() == 0.0 => {
                        #[allow(
                            clippy::cast_possible_truncation,
                            clippy::cast_sign_loss,
                            clippy::as_conversions
                        )]
                        let size = (*w as u32, *h as u32);
                        size
                    }
                    _ => {
                        return Err(AdapterError::Config(
                            "field 'image_size' must be [width, height] positive integers".into(),
                        ));
                    }
                }
            }
        };

        let preprocess = PreprocessConfig {
            size,
            mean: config
                .get("image_mean")
                .map(|v| get_f32_list(v, "image_mean"))
                .transpose()?
                .unwrap_or(defaults.preprocess.mean),
            std: config
                .get("image_std")
                .map(|v| get_f32_list(v, "image_std"))
                .transpose()?
                .unwrap_or(defaults.preprocess.std),
        };

        let parsed = Self {
            image_proj,
            text_sequence_length: get_usize_or(
                config,
                "text_sequence_length",
                defaults.text_sequence_length,
            )?,
            image_sequence_length: get_usize_or(
                config,
                "image_sequence_length",
                defaults.image_sequence_length,
            )?,
            scale: get_f64_or(config, "scale", defaults.scale)?,
            preprocess,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Config`] if a size is zero, `scale` is not
    /// finite, or the image pseudo-token count differs from the number of
    /// image positions each site slices out of the context.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("clip_image_embedding_dim", self.image_proj.clip_image_embedding_dim),
            ("clip_text_embedding_dim", self.image_proj.clip_text_embedding_dim),
            ("sequence_length", self.image_proj.sequence_length),
            ("text_sequence_length", self.text_sequence_length),
            ("image_sequence_length", self.image_sequence_length),
        ];
        if let Some((key, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(AdapterError::Config(format!("field '{key}' must be > 0")));
        }
        if self.image_proj.sequence_length != self.image_sequence_length {
            return Err(AdapterError::Config(format!(
                "projection emits {} pseudo-tokens but sites slice {} image positions",
                self.image_proj.sequence_length, self.image_sequence_length
            )));
        }
        if !self.scale.is_finite() {
            return Err(AdapterError::Config(format!(
                "field 'scale' must be finite, got {}",
                self.scale
            )));
        }
        if self.preprocess.mean.len() != self.preprocess.std.len() {
            return Err(AdapterError::Config(format!(
                "image_mean has {} channels but image_std has {}",
                self.preprocess.mean.len(),
                self.preprocess.std.len()
            )));
        }
        Ok(())
    }

    /// The per-site slice of this configuration.
    #[must_use]
    pub const fn cross_attention(&self) -> CrossAttentionConfig {
        CrossAttentionConfig {
            text_sequence_length: self.text_sequence_length,
            image_sequence_length: self.image_sequence_length,
            scale: self.scale,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Extract a `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> Result<usize> {
    let Some(value) = config.get(key) else {
        return Ok(default);
    };
    let val = value
        .as_u64()
        .ok_or_else(|| AdapterError::Config(format!("field '{key}' must be an unsigned integer")))?;
    usize::try_from(val)
        .map_err(|_| AdapterError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> Result<f64> {
    match config.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| AdapterError::Config(format!("field '{key}' must be a number"))),
    }
}

/// Read a JSON array of numbers as `f32`s.
fn get_f32_list(value: &Value, key: &str) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| AdapterError::Config(format!("field '{key}' must be an array")))?;
    items
        .iter()
        .map(|item| {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            item.as_f64().map(|v| v as f32).ok_or_else(|| {
                AdapterError::Config(format!("field '{key}' must contain only numbers"))
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_sizes() {
        let config = IPAdapterConfig::default();
        assert_eq!(config.image_proj.clip_image_embedding_dim, 1024);
        assert_eq!(config.image_proj.clip_text_embedding_dim, 768);
        assert_eq!(config.image_proj.sequence_length, 4);
        assert_eq!(config.text_sequence_length, 77);
        assert_eq!(config.image_sequence_length, 4);
        assert!((config.scale - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.preprocess.size, (224, 224));
        config.validate().unwrap();
    }

    #[test]
    fn empty_object_gives_defaults() {
        let config = IPAdapterConfig::from_json(&serde_json::json!({})).unwrap();
        assert_eq!(config, IPAdapterConfig::default());
    }

    #[test]
    fn parse_plus_variant() {
        let json = serde_json::json!({
            "clip_image_embedding_dim": 1280,
            "clip_text_embedding_dim": 2048,
            "sequence_length": 16,
            "image_sequence_length": 16,
            "scale": 0.5,
            "image_size": [336, 336],
            "image_mean": [0.5, 0.5, 0.5],
            "image_std": [0.5, 0.5, 0.5]
        });
        let config = IPAdapterConfig::from_json(&json).unwrap();
        assert_eq!(config.image_proj.clip_image_embedding_dim, 1280);
        assert_eq!(config.image_proj.clip_text_embedding_dim, 2048);
        assert_eq!(config.cross_attention().image_sequence_length, 16);
        assert_eq!(config.cross_attention().text_sequence_length, 77);
        assert!((config.cross_attention().scale - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.preprocess.size, (336, 336));
        assert_eq!(config.preprocess.std, vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let json = serde_json::json!({"scale": "high"});
        assert!(matches!(
            IPAdapterConfig::from_json(&json),
            Err(AdapterError::Config(_))
        ));
        let json = serde_json::json!({"sequence_length": -4});
        assert!(IPAdapterConfig::from_json(&json).is_err());
        assert!(IPAdapterConfig::from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn mismatched_token_counts_are_rejected() {
        let json = serde_json::json!({"sequence_length": 16});
        let err = IPAdapterConfig::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("pseudo-tokens"));
    }

    #[test]
    fn bad_image_size_is_rejected() {
        let json = serde_json::json!({"image_size": [224]});
        assert!(IPAdapterConfig::from_json(&json).is_err());
        let json = serde_json::json!({"image_size": [0, 224]});
        assert!(IPAdapterConfig::from_json(&json).is_err());
    }

    #[test]
    fn attention_config_helpers() {
        let sa = AttentionConfig::self_attention(64, 4);
        assert_eq!(sa.key_embedding_dim, 64);
        assert_eq!(sa.inner_dim, 64);
        let ca = AttentionConfig::cross_attention(64, 32, 4);
        assert_eq!(ca.key_embedding_dim, 32);
        assert_eq!(ca.value_embedding_dim, 32);
        assert_eq!(ca.num_heads, 4);
    }
}
