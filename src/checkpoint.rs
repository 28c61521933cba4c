//! Checkpoint directory layout and the modality derived from it.
//!
//! A checkpoint is a diffusers-style directory:
//!
//! ```text
//! <checkpoint>/
//!   transformer/config.json + diffusion_pytorch_model*.safetensors
//!   vae/config.json         + diffusion_pytorch_model*.safetensors
//!   scheduler/scheduler_config.json
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::loader::{LoaderError, load_model_config};
use crate::scheduler::SchedulerConfig;

pub const TRANSFORMER_DIR: &str = "transformer";
pub const VAE_DIR: &str = "vae";
pub const SCHEDULER_DIR: &str = "scheduler";
pub const CONFIG_FILE: &str = "config.json";
pub const SCHEDULER_CONFIG_FILE: &str = "scheduler_config.json";

/// The fields of `transformer/config.json` the session cares about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_channels")]
    pub in_channels: usize,
    #[serde(default = "default_channels")]
    pub out_channels: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The fields of `vae/config.json` the session cares about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeConfig {
    #[serde(default = "default_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_temporal_compression")]
    pub temporal_compression_ratio: usize,
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_channels() -> usize {
    16
}

fn default_num_layers() -> usize {
    30
}

fn default_patch_size() -> usize {
    2
}

fn default_temporal_compression() -> usize {
    4
}

fn default_block_out_channels() -> Vec<usize> {
    vec![128, 256, 256, 512]
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            in_channels: default_channels(),
            out_channels: default_channels(),
            num_layers: default_num_layers(),
            patch_size: default_patch_size(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            latent_channels: default_channels(),
            temporal_compression_ratio: default_temporal_compression(),
            block_out_channels: default_block_out_channels(),
            extra: serde_json::Map::new(),
        }
    }
}

impl VaeConfig {
    /// Each down block but the last halves the spatial resolution
    pub fn spatial_compression_ratio(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }
}

/// What a checkpoint can be conditioned on.
///
/// An inpainting transformer takes the noisy latent plus the masked
/// conditioning latent, so its input width differs from the VAE's latent
/// width. A text-to-video transformer takes the latent alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointModality {
    TextToVideoOnly,
    ImageVideoCapable,
}

impl CheckpointModality {
    pub fn from_channels(in_channels: usize, latent_channels: usize) -> Self {
        if in_channels == latent_channels {
            Self::TextToVideoOnly
        } else {
            Self::ImageVideoCapable
        }
    }

    pub fn accepts_image_conditioning(self) -> bool {
        self == Self::ImageVideoCapable
    }

    pub fn pipeline_variant(self) -> PipelineVariant {
        match self {
            Self::TextToVideoOnly => PipelineVariant::Plain,
            Self::ImageVideoCapable => PipelineVariant::Inpaint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineVariant {
    /// Text (or reference video) to video
    Plain,
    /// Accepts a masked conditioning video built from start/end images
    Inpaint,
}

/// How idle components are parked off the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffloadPolicy {
    /// Every sub-module is moved on demand; slowest, smallest footprint
    Sequential,
    /// Whole models are moved between calls
    ModelLevel,
}

impl OffloadPolicy {
    pub fn for_low_memory(low_gpu_memory_mode: bool) -> Self {
        if low_gpu_memory_mode {
            Self::Sequential
        } else {
            Self::ModelLevel
        }
    }
}

/// Paths of the components inside one checkpoint directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLayout {
    root: PathBuf,
}

impl CheckpointLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn transformer_dir(&self) -> PathBuf {
        self.root.join(TRANSFORMER_DIR)
    }

    pub fn vae_dir(&self) -> PathBuf {
        self.root.join(VAE_DIR)
    }

    pub fn transformer_config(&self) -> PathBuf {
        self.transformer_dir().join(CONFIG_FILE)
    }

    pub fn vae_config(&self) -> PathBuf {
        self.vae_dir().join(CONFIG_FILE)
    }

    pub fn scheduler_config(&self) -> PathBuf {
        self.root.join(SCHEDULER_DIR).join(SCHEDULER_CONFIG_FILE)
    }

    pub fn read_transformer_config(&self) -> Result<TransformerConfig, LoaderError> {
        load_model_config(self.transformer_config())
    }

    pub fn read_vae_config(&self) -> Result<VaeConfig, LoaderError> {
        load_model_config(self.vae_config())
    }

    /// A checkpoint without a scheduler config falls back to the defaults
    pub fn read_scheduler_config(&self) -> Result<SchedulerConfig, LoaderError> {
        match load_model_config(self.scheduler_config()) {
            Err(LoaderError::MissingFile { .. }) => Ok(SchedulerConfig::default()),
            other => other,
        }
    }
}

/// Identity and shape facts of the loaded checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointHandle {
    pub name: String,
    pub path: PathBuf,
    pub in_channels: usize,
    pub latent_channels: usize,
    /// Pixel frames per latent frame
    pub temporal_compression_ratio: usize,
    pub spatial_compression_ratio: usize,
    pub modality: CheckpointModality,
}

impl CheckpointHandle {
    pub fn from_configs(path: impl Into<PathBuf>, transformer: &TransformerConfig, vae: &VaeConfig) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            in_channels: transformer.in_channels,
            latent_channels: vae.latent_channels,
            temporal_compression_ratio: vae.temporal_compression_ratio.max(1),
            spatial_compression_ratio: vae.spatial_compression_ratio(),
            modality: CheckpointModality::from_channels(transformer.in_channels, vae.latent_channels),
        }
    }

    pub fn variant(&self) -> PipelineVariant {
        self.modality.pipeline_variant()
    }

    /// Latent frames the VAE produces for `num_frames` pixel frames
    pub fn latent_frames(&self, num_frames: usize) -> usize {
        num_frames.saturating_sub(1) / self.temporal_compression_ratio + 1
    }
}
