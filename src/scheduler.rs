//! Sampler selection for the diffusion pipeline.
//!
//! A checkpoint ships one `scheduler/scheduler_config.json`. Swapping the
//! sampling algorithm rebuilds the scheduler from that config, so the shared
//! hyper-parameters (beta schedule, timestep spacing, prediction type and any
//! keys this crate does not model) are carried across every swap.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sampling algorithms selectable for a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SamplerKind {
    #[default]
    #[serde(rename = "Euler")]
    Euler,
    #[serde(rename = "Euler A")]
    EulerAncestral,
    #[serde(rename = "DPM++")]
    DpmSolverMultistep,
    #[serde(rename = "PNDM")]
    Pndm,
    /// DDIM variant with the CogVideoX SNR shift
    #[serde(rename = "DDIM_Cog")]
    DdimCog,
    #[serde(rename = "DDIM_Origin")]
    DdimOrigin,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 6] = [
        Self::Euler,
        Self::EulerAncestral,
        Self::DpmSolverMultistep,
        Self::Pndm,
        Self::DdimCog,
        Self::DdimOrigin,
    ];

    /// Name shown to users and sent over the wire
    pub fn label(self) -> &'static str {
        match self {
            Self::Euler => "Euler",
            Self::EulerAncestral => "Euler A",
            Self::DpmSolverMultistep => "DPM++",
            Self::Pndm => "PNDM",
            Self::DdimCog => "DDIM_Cog",
            Self::DdimOrigin => "DDIM_Origin",
        }
    }

    /// Scheduler class written into the rebuilt config
    pub fn class_name(self) -> &'static str {
        match self {
            Self::Euler => "EulerDiscreteScheduler",
            Self::EulerAncestral => "EulerAncestralDiscreteScheduler",
            Self::DpmSolverMultistep => "DPMSolverMultistepScheduler",
            Self::Pndm => "PNDMScheduler",
            Self::DdimCog => "CogVideoXDDIMScheduler",
            Self::DdimOrigin => "DDIMScheduler",
        }
    }

    /// Whether each step injects fresh noise
    pub fn is_stochastic(self) -> bool {
        matches!(self, Self::EulerAncestral)
    }

    /// Algorithm-specific keys, only filled in when the source config lacks them
    fn default_extras(self) -> &'static [(&'static str, DefaultValue)] {
        match self {
            Self::DpmSolverMultistep => &[
                ("solver_order", DefaultValue::Int(2)),
                ("algorithm_type", DefaultValue::Str("dpmsolver++")),
            ],
            Self::Pndm => &[("skip_prk_steps", DefaultValue::Bool(true))],
            Self::DdimCog | Self::DdimOrigin => &[
                ("set_alpha_to_one", DefaultValue::Bool(true)),
                ("clip_sample", DefaultValue::Bool(false)),
            ],
            Self::Euler | Self::EulerAncestral => &[],
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DefaultValue {
    Int(i64),
    Bool(bool),
    Str(&'static str),
}

impl DefaultValue {
    fn to_json(self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(v),
            Self::Bool(v) => serde_json::Value::from(v),
            Self::Str(v) => serde_json::Value::from(v),
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SamplerKind {
    type Err = UnknownSampler;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownSampler(wanted.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown sampler {0:?}; expected one of Euler, Euler A, DPM++, PNDM, DDIM_Cog, DDIM_Origin")]
pub struct UnknownSampler(pub String);

/// Contents of a diffusers-style `scheduler_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(rename = "_class_name", default)]
    pub class_name: Option<String>,
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    /// "linear" or "scaled_linear"
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
    /// "epsilon" or "v_prediction"
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
    /// "leading", "trailing" or "linspace"
    #[serde(default = "default_timestep_spacing")]
    pub timestep_spacing: String,
    #[serde(default)]
    pub steps_offset: usize,
    #[serde(default)]
    pub rescale_betas_zero_snr: bool,
    /// Keys not modelled above, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.012
}

fn default_beta_schedule() -> String {
    "scaled_linear".to_string()
}

fn default_prediction_type() -> String {
    "v_prediction".to_string()
}

fn default_timestep_spacing() -> String {
    "trailing".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            class_name: None,
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
            timestep_spacing: default_timestep_spacing(),
            steps_offset: 0,
            rescale_betas_zero_snr: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// A sampling algorithm bound to a scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduler {
    kind: SamplerKind,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Rebuild `config` for `kind`, keeping every shared hyper-parameter
    pub fn from_config(kind: SamplerKind, config: &SchedulerConfig) -> Self {
        let mut config = config.clone();
        config.class_name = Some(kind.class_name().to_string());
        for (key, value) in kind.default_extras() {
            config
                .extra
                .entry(key.to_string())
                .or_insert_with(|| value.to_json());
        }
        Self { kind, config }
    }

    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Training-time noise levels, `sigma = sqrt((1 - alpha_bar) / alpha_bar)`
    pub fn train_sigmas(&self) -> Vec<f64> {
        let n = self.config.num_train_timesteps.max(2);
        let betas: Vec<f64> = match self.config.beta_schedule.as_str() {
            "scaled_linear" => {
                let start = self.config.beta_start.sqrt();
                let end = self.config.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let b = start + (end - start) * i as f64 / (n - 1) as f64;
                        b * b
                    })
                    .collect()
            }
            _ => (0..n)
                .map(|i| {
                    self.config.beta_start
                        + (self.config.beta_end - self.config.beta_start) * i as f64
                            / (n - 1) as f64
                })
                .collect(),
        };

        let mut cumprod = 1.0;
        betas
            .iter()
            .map(|beta| {
                cumprod *= 1.0 - beta;
                // Clamp keeps zero-terminal-SNR rescaled schedules finite
                ((1.0 - cumprod) / cumprod.max(1e-12)).sqrt()
            })
            .collect()
    }

    /// Inference timesteps, highest noise first
    pub fn timesteps(&self, num_inference_steps: usize) -> Vec<f64> {
        if num_inference_steps == 0 {
            return Vec::new();
        }
        let train = self.config.num_train_timesteps.max(1);
        match self.config.timestep_spacing.as_str() {
            "leading" => {
                let ratio = (train / num_inference_steps).max(1);
                (0..num_inference_steps)
                    .map(|i| (i * ratio + self.config.steps_offset).min(train - 1) as f64)
                    .rev()
                    .collect()
            }
            "linspace" => {
                if num_inference_steps == 1 {
                    return vec![(train - 1) as f64];
                }
                let last = (train - 1) as f64;
                (0..num_inference_steps)
                    .map(|i| (last - last * i as f64 / (num_inference_steps - 1) as f64).round())
                    .collect()
            }
            _ => {
                let ratio = train as f64 / num_inference_steps as f64;
                (1..=num_inference_steps)
                    .rev()
                    .map(|i| ((i as f64 * ratio).round() - 1.0).max(0.0))
                    .collect()
            }
        }
    }

    /// Noise level at each inference timestep, with a terminal 0 appended
    pub fn inference_sigmas(&self, num_inference_steps: usize) -> Vec<f64> {
        let train = self.train_sigmas();
        let mut sigmas: Vec<f64> = self
            .timesteps(num_inference_steps)
            .into_iter()
            .map(|t| train[(t as usize).min(train.len() - 1)])
            .collect();
        sigmas.push(0.0);
        sigmas
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(SamplerKind::Euler, &SchedulerConfig::default())
    }
}
