//! Configuration for a studio instance: directory layout, precision, offload
//! mode and the optional hosted endpoint.

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_BASE_DIR: &str = "COGVIDEO_BASE_DIR";
pub const ENV_LOW_GPU_MEMORY: &str = "COGVIDEO_LOW_GPU_MEMORY";
pub const ENV_WEIGHT_DTYPE: &str = "COGVIDEO_WEIGHT_DTYPE";
pub const ENV_REMOTE_URL: &str = "EAS_URL";
pub const ENV_REMOTE_TOKEN: &str = "EAS_TOKEN";

/// Session directories are `<prefix><local start time>`
pub const SESSION_DIR_PREFIX: &str = "Gradio-";
pub const SESSION_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Numeric precision the checkpoint weights are held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPrecision {
    F32,
    F16,
    #[default]
    Bf16,
}

impl WeightPrecision {
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

impl FromStr for WeightPrecision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" | "fp32" => Ok(Self::F32),
            "f16" | "float16" | "fp16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            other => Err(ConfigError::InvalidPrecision(other.to_string())),
        }
    }
}

/// Hosted inference endpoint used by the proxy mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL, without the inference route
    pub url: String,
    /// Sent verbatim in the `Authorization` header
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_timeout() -> u64 {
    RemoteConfig::DEFAULT_TIMEOUT_SECS
}

impl RemoteConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
    pub const INFER_ROUTE: &'static str = "cogvideox_fun/infer_forward";

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), Self::INFER_ROUTE)
    }
}

/// Studio-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudioConfig {
    /// Root that the model and sample directories hang off
    pub base_dir: PathBuf,
    /// One sub-directory per diffusion-transformer checkpoint
    pub checkpoint_dir: PathBuf,
    /// Base-weight and LoRA archives (`*.safetensors`)
    pub personalized_dir: PathBuf,
    /// Motion-module archives, listed for completeness
    pub motion_module_dir: PathBuf,
    /// Each studio run gets its own sub-directory here
    pub output_dir: PathBuf,
    /// Sequential CPU offload instead of model-level offload
    pub low_gpu_memory_mode: bool,
    pub weight_precision: WeightPrecision,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self::with_base_dir(".")
    }
}

impl StudioConfig {
    /// Standard layout under `base`: `models/Diffusion_Transformer`,
    /// `models/Personalized_Model`, `models/Motion_Module` and `samples`.
    pub fn with_base_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        let models = base.join("models");
        Self {
            checkpoint_dir: models.join("Diffusion_Transformer"),
            personalized_dir: models.join("Personalized_Model"),
            motion_module_dir: models.join("Motion_Module"),
            output_dir: base.join("samples"),
            base_dir: base,
            low_gpu_memory_mode: false,
            weight_precision: WeightPrecision::default(),
            remote: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_BASE_DIR) {
            Some(dir) if !dir.trim().is_empty() => Self::with_base_dir(dir.trim()),
            _ => Self::default(),
        };

        if let Some(value) = lookup(ENV_LOW_GPU_MEMORY) {
            config.low_gpu_memory_mode = parse_flag(ENV_LOW_GPU_MEMORY, &value)?;
        }
        if let Some(value) = lookup(ENV_WEIGHT_DTYPE)
            && !value.trim().is_empty()
        {
            config.weight_precision = value.parse()?;
        }
        if let Some(url) = lookup(ENV_REMOTE_URL)
            && !url.trim().is_empty()
        {
            let mut remote = RemoteConfig::new(url.trim());
            if let Some(token) = lookup(ENV_REMOTE_TOKEN).filter(|t| !t.is_empty()) {
                remote = remote.with_token(token);
            }
            config.remote = Some(remote);
        }

        Ok(config)
    }

    pub fn with_low_gpu_memory_mode(mut self, enabled: bool) -> Self {
        self.low_gpu_memory_mode = enabled;
        self
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Fresh per-run directory, named after the local start time.
    pub fn new_session_dir(&self) -> PathBuf {
        self.session_dir_at(&chrono::Local::now())
    }

    pub fn session_dir_at<Tz>(&self, started: &chrono::DateTime<Tz>) -> PathBuf
    where
        Tz: chrono::TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        self.output_dir.join(format!(
            "{SESSION_DIR_PREFIX}{}",
            started.format(SESSION_TIME_FORMAT)
        ))
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Form defaults of the interactive front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    pub negative_prompt: String,
    pub num_inference_steps: usize,
    pub width: usize,
    pub height: usize,
    pub base_resolution: usize,
    pub num_frames: usize,
    pub overlap_frames: usize,
    pub chunk_frames: usize,
    pub guidance_scale: f64,
    pub denoise_strength: f64,
    pub lora_strength: f64,
    pub seed: String,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            negative_prompt: "The video is not of a high quality, it has a low resolution. \
                Watermark present in each frame. Strange motion trajectory. "
                .to_string(),
            num_inference_steps: 50,
            width: 672,
            height: 384,
            base_resolution: 512,
            num_frames: 49,
            overlap_frames: 4,
            chunk_frames: 25,
            guidance_scale: 7.0,
            denoise_strength: 0.70,
            lora_strength: 0.55,
            seed: "43".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported weight precision: {0}. Expected f32, f16 or bf16")]
    InvalidPrecision(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidFlag { name: String, value: String },
}
