//! Turning form/CLI fields into a [`GenerationRequest`] the orchestrator can run.
//!
//! Rules run in a fixed order and stop at the first violation, so the message a
//! user sees is always the most fundamental problem with the request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::buckets::size_from_reference;
use crate::checkpoint::CheckpointHandle;
use crate::config::GenerationDefaults;
use crate::error::{Result, StudioError};
use crate::media::{probe_image_size, probe_video_size};
use crate::registry::NONE_SELECTION;
use crate::scheduler::SamplerKind;
use crate::utils::deterministic_rng::entropy_seed;

const SIZE_STRIDE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResizeMode {
    /// Use the requested width and height
    #[default]
    #[serde(rename = "Generate by")]
    Fixed,
    /// Derive the size from the start image or reference video
    #[serde(rename = "Resize according to Reference")]
    FromReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GenerationMethod {
    #[default]
    #[serde(rename = "Video Generation")]
    Video,
    #[serde(rename = "Image Generation")]
    Image,
    #[serde(rename = "Long Video Generation")]
    LongVideo,
}

macro_rules! labelled_enum {
    ($ty:ty, $err:literal, { $($variant:path => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub fn label(self) -> &'static str {
                match self {
                    $($variant => $label),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }

        impl FromStr for $ty {
            type Err = StudioError;

            fn from_str(s: &str) -> Result<Self> {
                let wanted = s.trim();
                $(
                    if wanted.eq_ignore_ascii_case($label) {
                        return Ok($variant);
                    }
                )+
                Err(StudioError::configuration(format!(concat!($err, " {:?}"), wanted)))
            }
        }
    };
}

labelled_enum!(ResizeMode, "Unknown resize method", {
    ResizeMode::Fixed => "Generate by",
    ResizeMode::FromReference => "Resize according to Reference",
});

labelled_enum!(GenerationMethod, "Unknown generation method", {
    GenerationMethod::Video => "Video Generation",
    GenerationMethod::Image => "Image Generation",
    GenerationMethod::LongVideo => "Long Video Generation",
});

/// Request fields exactly as a form or the command line supplies them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRequest {
    pub base_weights: String,
    pub lora: String,
    pub lora_strength: f64,
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler: String,
    pub num_inference_steps: usize,
    pub resize_mode: ResizeMode,
    pub width: usize,
    pub height: usize,
    pub base_resolution: usize,
    pub method: GenerationMethod,
    pub num_frames: usize,
    pub overlap_frames: usize,
    pub chunk_frames: usize,
    pub guidance_scale: f64,
    pub start_image: Option<PathBuf>,
    pub end_image: Option<PathBuf>,
    pub reference_video: Option<PathBuf>,
    pub denoise_strength: f64,
    /// Empty or `-1` picks a random seed
    pub seed: String,
}

impl RawRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        let defaults = GenerationDefaults::default();
        Self {
            base_weights: NONE_SELECTION.to_string(),
            lora: NONE_SELECTION.to_string(),
            lora_strength: defaults.lora_strength,
            prompt: prompt.into(),
            negative_prompt: defaults.negative_prompt,
            sampler: SamplerKind::Euler.label().to_string(),
            num_inference_steps: defaults.num_inference_steps,
            resize_mode: ResizeMode::Fixed,
            width: defaults.width,
            height: defaults.height,
            base_resolution: defaults.base_resolution,
            method: GenerationMethod::Video,
            num_frames: defaults.num_frames,
            overlap_frames: defaults.overlap_frames,
            chunk_frames: defaults.chunk_frames,
            guidance_scale: defaults.guidance_scale,
            start_image: None,
            end_image: None,
            reference_video: None,
            denoise_strength: defaults.denoise_strength,
            seed: defaults.seed,
        }
    }
}

/// What the pipeline is conditioned on
#[derive(Debug, Clone, PartialEq)]
pub enum Conditioning {
    None,
    Image {
        start: PathBuf,
        end: Option<PathBuf>,
    },
    Video {
        path: PathBuf,
        denoise_strength: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Image,
    Video,
    LongVideo {
        chunk_frames: usize,
        overlap_frames: usize,
    },
}

/// A validated request; never modified after dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler: SamplerKind,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    /// Frames to produce; 1 in image mode
    pub num_frames: usize,
    pub conditioning: Conditioning,
    pub seed: u64,
    pub mode: GenerationMode,
}

impl GenerationRequest {
    pub fn is_image(&self) -> bool {
        self.mode == GenerationMode::Image
    }

    /// Still-image output, either by mode or by frame count
    pub fn produces_still(&self) -> bool {
        self.is_image() || self.num_frames == 1
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestValidator;

impl RequestValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, raw: &RawRequest, checkpoint: Option<&CheckpointHandle>) -> Result<GenerationRequest> {
        let checkpoint = checkpoint.ok_or(StudioError::NoCheckpoint)?;
        let sampler: SamplerKind = raw
            .sampler
            .parse()
            .map_err(|e: crate::scheduler::UnknownSampler| StudioError::configuration(e.to_string()))?;
        let seed = parse_seed(&raw.seed)?;
        if raw.num_inference_steps == 0 {
            return Err(StudioError::configuration("The number of sampling steps must be positive."));
        }
        if raw.guidance_scale < 0.0 || !raw.guidance_scale.is_finite() {
            return Err(StudioError::configuration("The guidance scale must be a non-negative number."));
        }

        let (width, height) = match raw.resize_mode {
            ResizeMode::FromReference => {
                let (ref_w, ref_h) = match (&raw.reference_video, &raw.start_image) {
                    (Some(video), _) => probe_video_size(video)?,
                    (None, Some(image)) => probe_image_size(image)?,
                    (None, None) => {
                        return Err(StudioError::validation(
                            "Please upload an image or video when using \"Resize according to Reference\".",
                        ));
                    }
                };
                let size = size_from_reference(ref_w, ref_h, raw.base_resolution);
                debug!(ref_w, ref_h, width = size.0, height = size.1, "Size derived from reference");
                size
            }
            ResizeMode::Fixed => (raw.width, raw.height),
        };

        let text_only = !checkpoint.modality.accepts_image_conditioning();
        if text_only && raw.start_image.is_some() {
            return Err(StudioError::configuration(
                "Please select an image to video pretrained model while using image to video.",
            ));
        }
        if text_only && raw.method == GenerationMethod::LongVideo {
            return Err(StudioError::configuration(
                "Please select an image to video pretrained model while using long video generation.",
            ));
        }
        if raw.start_image.is_none() && raw.end_image.is_some() {
            return Err(StudioError::validation(
                "If specifying the ending image of the video, please specify a starting image of the video.",
            ));
        }

        if raw.reference_video.is_some() {
            if raw.method == GenerationMethod::LongVideo {
                return Err(StudioError::validation(
                    "Video to video is not supported for long video generation.",
                ));
            }
            if raw.start_image.is_some() {
                return Err(StudioError::validation(
                    "A reference video cannot be combined with start or end images.",
                ));
            }
            if !(0.0..=1.0).contains(&raw.denoise_strength) {
                return Err(StudioError::configuration("The denoise strength must lie in [0, 1]."));
            }
        }
        if width == 0 || height == 0 || width % SIZE_STRIDE != 0 || height % SIZE_STRIDE != 0 {
            return Err(StudioError::configuration(format!(
                "Width and height must be positive multiples of {SIZE_STRIDE}, got {width}x{height}."
            )));
        }

        let mode = match raw.method {
            GenerationMethod::Image => GenerationMode::Image,
            GenerationMethod::Video => GenerationMode::Video,
            GenerationMethod::LongVideo => {
                if raw.chunk_frames == 0 || raw.overlap_frames == 0 || raw.overlap_frames >= raw.chunk_frames {
                    return Err(StudioError::configuration(format!(
                        "The overlap ({}) must be positive and smaller than the partial video length ({}).",
                        raw.overlap_frames, raw.chunk_frames
                    )));
                }
                // Every chunk but the last must decode to whole latent frames
                let ratio = checkpoint.temporal_compression_ratio;
                let aligned = (checkpoint.latent_frames(raw.chunk_frames) - 1) * ratio + 1;
                if aligned != raw.chunk_frames {
                    return Err(StudioError::configuration(format!(
                        "The partial video length ({}) must be {ratio}k + 1 frames, e.g. {aligned}.",
                        raw.chunk_frames
                    )));
                }
                GenerationMode::LongVideo {
                    chunk_frames: raw.chunk_frames,
                    overlap_frames: raw.overlap_frames,
                }
            }
        };
        let num_frames = match mode {
            GenerationMode::Image => 1,
            _ => raw.num_frames,
        };
        if num_frames == 0 {
            return Err(StudioError::configuration("The video length must be positive."));
        }

        let conditioning = match (&raw.reference_video, &raw.start_image) {
            // A plain transformer has no input for a masked video latent
            (Some(path), _) if text_only => {
                warn!(
                    path = %path.display(),
                    checkpoint = %checkpoint.name,
                    "Reference video ignored: the checkpoint only supports text to video"
                );
                Conditioning::None
            }
            (Some(path), _) => Conditioning::Video {
                path: path.clone(),
                denoise_strength: raw.denoise_strength,
            },
            (None, Some(start)) => Conditioning::Image {
                start: start.clone(),
                end: raw.end_image.clone(),
            },
            (None, None) => Conditioning::None,
        };

        Ok(GenerationRequest {
            prompt: raw.prompt.clone(),
            negative_prompt: raw.negative_prompt.clone(),
            sampler,
            num_inference_steps: raw.num_inference_steps,
            guidance_scale: raw.guidance_scale,
            width,
            height,
            num_frames,
            conditioning,
            seed,
            mode,
        })
    }
}

/// Empty or `-1` draws a fresh seed
pub fn parse_seed(seed: &str) -> Result<u64> {
    let seed = seed.trim();
    if seed.is_empty() || seed == "-1" {
        return Ok(entropy_seed());
    }
    seed.parse::<u64>()
        .map_err(|_| StudioError::configuration(format!("Invalid seed {seed:?}: expected an integer or -1.")))
}
