//! Shared fixtures: tiny on-disk checkpoints, adapter archives and a
//! pipeline that records what it was asked to do.

#![allow(dead_code)]

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_cogvideo::checkpoint::{PipelineVariant, SCHEDULER_CONFIG_FILE};
use candle_cogvideo::config::WeightPrecision;
use candle_cogvideo::pipeline::{DiffusionPipeline, PipelineCall, PipelineContext, PipelineFactory, PipelineSpec};
use candle_cogvideo::{ModelSession, StudioConfig};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const Q_PROJ: &str = "transformer_blocks.0.attn1.to_q.weight";
pub const K_PROJ: &str = "transformer_blocks.0.attn1.to_k.weight";
pub const PROJ_OUT_BIAS: &str = "proj_out.bias";

/// Channels of a text-to-video-only checkpoint (same as the latent channels)
pub const TEXT_ONLY_CHANNELS: usize = 16;
/// Channels of an inpainting checkpoint: latents, masked video and mask
pub const INPAINT_CHANNELS: usize = 33;

pub fn save_tensors(path: &Path, tensors: &[(&str, Tensor)]) {
    let map: HashMap<String, Tensor> = tensors
        .iter()
        .map(|(name, t)| (name.to_string(), t.clone()))
        .collect();
    candle_core::safetensors::save(&map, path).unwrap();
}

pub fn write_json(path: &Path, value: &serde_json::Value) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

fn q_weight() -> Tensor {
    Tensor::arange(0f32, 16., &Device::Cpu).unwrap().reshape((4, 4)).unwrap()
}

/// Write a diffusers-style checkpoint directory under `root/name`
pub fn write_checkpoint(root: &Path, name: &str, in_channels: usize) -> PathBuf {
    let dir = root.join(name);
    write_json(
        &dir.join("transformer/config.json"),
        &serde_json::json!({
            "_class_name": "CogVideoXTransformer3DModel",
            "in_channels": in_channels,
            "out_channels": 16,
            "num_layers": 1,
            "patch_size": 2
        }),
    );
    save_tensors(
        &dir.join("transformer/diffusion_pytorch_model.safetensors"),
        &[
            (format!("transformer.{Q_PROJ}").as_str(), q_weight()),
            (K_PROJ, Tensor::ones((4, 4), DType::F32, &Device::Cpu).unwrap()),
            (PROJ_OUT_BIAS, Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap()),
        ],
    );

    write_json(
        &dir.join("vae/config.json"),
        &serde_json::json!({
            "latent_channels": 16,
            "temporal_compression_ratio": 4,
            "block_out_channels": [128, 256, 256, 512]
        }),
    );
    save_tensors(
        &dir.join("vae/diffusion_pytorch_model.safetensors"),
        &[("decoder.conv_in.bias", Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap())],
    );

    write_json(
        &dir.join("scheduler").join(SCHEDULER_CONFIG_FILE),
        &serde_json::json!({
            "_class_name": "CogVideoXDDIMScheduler",
            "num_train_timesteps": 1000,
            "beta_start": 0.00085,
            "beta_end": 0.012,
            "beta_schedule": "scaled_linear",
            "prediction_type": "v_prediction",
            "timestep_spacing": "trailing",
            "snr_shift_scale": 3.0
        }),
    );
    dir
}

/// Rank-1 kohya-style adapter on the query projection: `up @ down` is all ones
pub fn write_lora(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let stem = "lora_unet_transformer_blocks_0_attn1_to_q";
    save_tensors(
        path,
        &[
            (format!("{stem}.lora_down.weight").as_str(), Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap()),
            (format!("{stem}.lora_up.weight").as_str(), Tensor::ones((4, 1), DType::F32, &Device::Cpu).unwrap()),
            (format!("{stem}.alpha").as_str(), Tensor::new(&[1f32], &Device::Cpu).unwrap()),
        ],
    );
}

pub fn write_png(path: &Path, width: u32, height: u32, rgb: [u8; 3]) {
    image::RgbImage::from_pixel(width, height, image::Rgb(rgb))
        .save(path)
        .unwrap();
}

pub fn studio_config(base: &Path) -> StudioConfig {
    let mut config = StudioConfig::with_base_dir(base);
    config.weight_precision = WeightPrecision::F32;
    config
}

pub fn q_values(session: &ModelSession) -> Vec<f32> {
    session
        .transformer()
        .unwrap()
        .get(Q_PROJ)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

/// What one pipeline invocation saw
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub num_frames: usize,
    pub width: usize,
    pub height: usize,
    /// Per-frame mask values of the conditioning payload, if any
    pub mask: Option<Vec<f32>>,
    pub has_clip_image: bool,
    pub strength: Option<f64>,
    /// Query projection as merged at call time
    pub q_weight: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub calls: Arc<Mutex<Vec<RecordedCall>>>,
    pub fail: Arc<Mutex<bool>>,
    pub builds: Arc<Mutex<usize>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn factory(&self) -> Box<dyn PipelineFactory> {
        Box::new(RecordingFactory(self.clone()))
    }
}

pub struct RecordingFactory(pub Recorder);

impl PipelineFactory for RecordingFactory {
    fn build(&self, spec: &PipelineSpec) -> candle_core::Result<Box<dyn DiffusionPipeline>> {
        *self.0.builds.lock().unwrap() += 1;
        Ok(Box::new(RecordingPipeline {
            variant: spec.variant,
            recorder: self.0.clone(),
        }))
    }
}

pub struct RecordingPipeline {
    variant: PipelineVariant,
    recorder: Recorder,
}

impl DiffusionPipeline for RecordingPipeline {
    fn variant(&self) -> PipelineVariant {
        self.variant
    }

    fn generate(&mut self, call: &PipelineCall, ctx: PipelineContext<'_>) -> candle_core::Result<Tensor> {
        let mask = match &call.conditioning {
            Some(payload) => Some(payload.mask.to_dtype(DType::F32)?.i((0, 0, .., 0, 0))?.to_vec1::<f32>()?),
            None => None,
        };
        let q_weight = match ctx.transformer.get(Q_PROJ) {
            Some(t) => t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
            None => Vec::new(),
        };
        self.recorder.calls.lock().unwrap().push(RecordedCall {
            num_frames: call.num_frames,
            width: call.width,
            height: call.height,
            mask,
            has_clip_image: call.conditioning.as_ref().is_some_and(|c| c.clip_image.is_some()),
            strength: call.conditioning.as_ref().map(|c| c.strength),
            q_weight,
        });

        if *self.recorder.fail.lock().unwrap() {
            candle_core::bail!("out of memory");
        }
        Tensor::full(0.5f32, (1, 3, call.num_frames, call.height, call.width), &Device::Cpu)
    }
}
