// SPDX-License-Identifier: MIT OR Apache-2.0

//! Weight-bundle routing.
//!
//! A bundle is a flat `key -> tensor` map. IP-Adapter checkpoints partition
//! it by prefix: `image_proj.<rest>` for the projection and
//! `ip_adapter.<NNN>.<rest>` for the per-site adapter at ordinal `NNN`
//! (zero-padded to three digits, in site traversal order).

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Prefix of the projection's parameters.
pub const IMAGE_PROJ_PREFIX: &str = "image_proj.";

/// Prefix shared by all per-site adapter parameters.
pub const IP_ADAPTER_PREFIX: &str = "ip_adapter.";

/// Prefix of the per-site adapter at `ordinal`, e.g. `ip_adapter.002.`.
#[must_use]
pub fn adapter_prefix(ordinal: usize) -> String {
    format!("{IP_ADAPTER_PREFIX}{ordinal:03}.")
}

/// Entries of `bundle` under `prefix`, with the prefix stripped.
#[must_use]
pub fn sub_bundle(bundle: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    bundle
        .iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(prefix)
                .map(|rest| (rest.to_owned(), tensor.clone()))
        })
        .collect()
}

/// Ordinal encoded in an `ip_adapter.NNN.` key, if it is well formed.
#[must_use]
pub fn adapter_ordinal(key: &str) -> Option<usize> {
    let rest = key.strip_prefix(IP_ADAPTER_PREFIX)?;
    let (ordinal, _) = rest.split_once('.')?;
    if ordinal.len() == 3 && ordinal.bytes().all(|b| b.is_ascii_digit()) {
        ordinal.parse().ok()
    } else {
        None
    }
}

/// Read every tensor of a `.safetensors` file onto `device`.
///
/// # Errors
///
/// Returns [`AdapterError::Model`](crate::AdapterError::Model) if the file
/// cannot be read or parsed.
pub fn load_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let bundle = candle_core::safetensors::load(path, device)?;
    tracing::info!(path = %path.display(), tensors = bundle.len(), "loaded weight bundle");
    Ok(bundle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::DType;

    use super::*;

    fn bundle(keys: &[&str]) -> HashMap<String, Tensor> {
        keys.iter()
            .map(|k| {
                (
                    (*k).to_owned(),
                    Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn prefix_is_zero_padded() {
        assert_eq!(adapter_prefix(0), "ip_adapter.000.");
        assert_eq!(adapter_prefix(15), "ip_adapter.015.");
        assert_eq!(adapter_prefix(1234), "ip_adapter.1234.");
    }

    #[test]
    fn sub_bundle_strips_prefix() {
        let all = bundle(&[
            "image_proj.Linear.weight",
            "ip_adapter.000.Distribute.Parallel_1.Chain_2.Linear.weight",
            "ip_adapter.001.Distribute.Parallel_1.Chain_2.Linear.weight",
        ]);
        let proj = sub_bundle(&all, IMAGE_PROJ_PREFIX);
        assert_eq!(proj.keys().collect::<Vec<_>>(), vec!["Linear.weight"]);
        let first = sub_bundle(&all, &adapter_prefix(0));
        assert_eq!(
            first.keys().collect::<Vec<_>>(),
            vec!["Distribute.Parallel_1.Chain_2.Linear.weight"]
        );
        assert!(sub_bundle(&all, &adapter_prefix(7)).is_empty());
    }

    #[test]
    fn ordinals_parse_only_when_well_formed() {
        assert_eq!(adapter_ordinal("ip_adapter.002.x.weight"), Some(2));
        assert_eq!(adapter_ordinal("ip_adapter.2.x.weight"), None);
        assert_eq!(adapter_ordinal("ip_adapter.abc.x"), None);
        assert_eq!(adapter_ordinal("image_proj.Linear.weight"), None);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_safetensors("/nonexistent/weights.safetensors", &Device::Cpu).is_err());
    }
}
