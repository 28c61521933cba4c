//! Low-rank adapters: parsing archives, merging into the transformer and
//! putting the original parameters back.
//!
//! Two key layouts are understood:
//!
//! - kohya style: `lora_unet_<path>.lora_down.weight`, `.lora_up.weight`, `.alpha`
//!   (also with a `lora_transformer_` prefix)
//! - peft style: `transformer.<path>.lora_A.weight`, `.lora_B.weight`
//!
//! `<path>` is matched against the transformer's `*.weight` parameters with
//! dots and underscores treated alike.

use candle_core::{DType, Device, Tensor};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::loader::{LoaderError, WeightLoader};
use crate::weights::ParamStore;

const STEM_PREFIXES: [&str; 3] = ["lora_unet_", "lora_transformer_", "transformer."];

/// One adapted linear (or 1x1 / kxk conv) layer
#[derive(Debug, Clone)]
pub struct LoraLayer {
    /// Parameter name in the [`ParamStore`]
    pub target: String,
    /// `[rank, in]` (or `[rank, in, kh, kw]`)
    pub down: Tensor,
    /// `[out, rank]` (or `[out, rank, 1, 1]`)
    pub up: Tensor,
    pub alpha: Option<f64>,
}

impl LoraLayer {
    pub fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(1).max(1)
    }

    /// `alpha / rank`, or 1 when the archive carries no alpha
    pub fn scale(&self) -> f64 {
        let rank = self.rank() as f64;
        self.alpha.unwrap_or(rank) / rank
    }

    /// `up @ down` in f32, reshaped to the target's shape
    pub fn delta(&self, target_dims: &[usize]) -> candle_core::Result<Tensor> {
        let rank = self.rank();
        let down = self.down.to_dtype(DType::F32)?.reshape((rank, ()))?;
        let up = self.up.to_dtype(DType::F32)?;
        let out = up.dims().first().copied().unwrap_or(0);
        let up = up.reshape((out, rank))?;
        up.matmul(&down)?.reshape(target_dims)
    }
}

#[derive(Default)]
struct PartialLayer {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// A parsed adapter, resolved against one transformer
#[derive(Debug, Clone, Default)]
pub struct LoraWeights {
    layers: Vec<LoraLayer>,
    unmatched: Vec<String>,
}

impl LoraWeights {
    /// Read an archive and resolve it against `params`
    pub fn load(path: impl AsRef<Path>, params: &ParamStore, device: &Device) -> Result<Self, LoaderError> {
        let tensors = WeightLoader::new(device.clone(), DType::F32).load_file(path.as_ref())?;
        let weights = Self::from_tensors(tensors, params)?;
        info!(
            path = %path.as_ref().display(),
            layers = weights.layers.len(),
            unmatched = weights.unmatched.len(),
            "Loaded LoRA"
        );
        Ok(weights)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>, params: &ParamStore) -> Result<Self, LoaderError> {
        let targets: HashMap<String, &str> = params
            .names()
            .filter_map(|name| name.strip_suffix(".weight").map(|stem| (normalize(stem), name)))
            .collect();

        let mut grouped: BTreeMap<String, PartialLayer> = BTreeMap::new();
        for (key, tensor) in tensors {
            let (stem, part) = if let Some(stem) = key
                .strip_suffix(".lora_down.weight")
                .or_else(|| key.strip_suffix(".lora_A.weight"))
            {
                (stem, Part::Down)
            } else if let Some(stem) = key
                .strip_suffix(".lora_up.weight")
                .or_else(|| key.strip_suffix(".lora_B.weight"))
            {
                (stem, Part::Up)
            } else if let Some(stem) = key.strip_suffix(".alpha") {
                (stem, Part::Alpha)
            } else {
                debug!(key = %key, "Skipping non-LoRA tensor");
                continue;
            };

            let entry = grouped.entry(stem.to_string()).or_default();
            match part {
                Part::Down => entry.down = Some(tensor),
                Part::Up => entry.up = Some(tensor),
                Part::Alpha => {
                    let value = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
                    entry.alpha = value.first().copied();
                }
            }
        }

        let mut layers = Vec::new();
        let mut unmatched = Vec::new();
        for (stem, partial) in grouped {
            let target = targets.get(&normalize(strip_prefix(&stem)));
            match (target, partial.down, partial.up) {
                (Some(target), Some(down), Some(up)) => layers.push(LoraLayer {
                    target: target.to_string(),
                    down,
                    up,
                    alpha: partial.alpha,
                }),
                _ => unmatched.push(stem),
            }
        }

        if !unmatched.is_empty() {
            warn!(count = unmatched.len(), first = %unmatched[0], "LoRA layers without a matching parameter");
        }
        Ok(Self { layers, unmatched })
    }

    pub fn layers(&self) -> &[LoraLayer] {
        &self.layers
    }

    pub fn unmatched(&self) -> &[String] {
        &self.unmatched
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

enum Part {
    Down,
    Up,
    Alpha,
}

fn strip_prefix(stem: &str) -> &str {
    STEM_PREFIXES
        .iter()
        .find_map(|prefix| stem.strip_prefix(prefix))
        .unwrap_or(stem)
}

fn normalize(name: &str) -> String {
    name.replace('.', "_")
}

/// Pre-merge values of every parameter a merge touched
#[derive(Debug)]
#[must_use = "dropping a MergedLora loses the only copy of the original weights"]
pub struct MergedLora {
    originals: Vec<(String, Tensor)>,
}

impl MergedLora {
    pub fn len(&self) -> usize {
        self.originals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }
}

/// `W' = W + strength * (alpha / rank) * up @ down` for every layer.
///
/// All new values are computed before the first write, so an error leaves
/// `params` untouched.
pub fn merge(params: &mut ParamStore, lora: &LoraWeights, strength: f64) -> candle_core::Result<MergedLora> {
    let mut updated = Vec::with_capacity(lora.layers.len());
    for layer in &lora.layers {
        let Some(current) = params.get(&layer.target) else {
            continue;
        };
        let delta = (layer.delta(current.dims())? * (strength * layer.scale()))?;
        let merged = (current.to_dtype(DType::F32)? + delta.to_device(current.device())?)?
            .to_dtype(current.dtype())?;
        updated.push((layer.target.clone(), merged));
    }

    let mut originals = Vec::with_capacity(updated.len());
    for (name, merged) in updated {
        if let Some(original) = params.replace(&name, merged) {
            originals.push((name, original));
        }
    }
    debug!(layers = originals.len(), strength, "Merged LoRA");
    Ok(MergedLora { originals })
}

/// Put back the exact tensors a [`merge`] replaced
pub fn restore(params: &mut ParamStore, merged: MergedLora) {
    let count = merged.originals.len();
    for (name, original) in merged.originals.into_iter().rev() {
        params.replace(&name, original);
    }
    debug!(layers = count, "Restored pre-LoRA weights");
}
