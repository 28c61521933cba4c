//! Contract between the orchestrator and a diffusion backend.
//!
//! The denoising network, VAE and text encoder live behind
//! [`DiffusionPipeline`]. A session owns exactly one boxed pipeline plus the
//! transformer parameters and scheduler it is driven with; every call hands
//! those in by reference so LoRA merges on the session are what the backend
//! samples with.
//!
//! ```text
//! PipelineCall ─┐
//! ParamStore  ──┼─> DiffusionPipeline::generate ─> [1, 3, F, H, W] in [0, 1]
//! Scheduler   ──┤
//! Pcg32       ──┘
//! ```
//!
//! [`PreviewPipeline`] is the in-tree backend: it follows the scheduler's
//! sigma schedule towards a prompt-derived target without any network, which
//! makes every orchestration path runnable and deterministic for a seed.

use candle_core::{DType, Device, Result, Tensor};
use image::RgbImage;
use tracing::debug;

use crate::checkpoint::{CheckpointHandle, OffloadPolicy, PipelineVariant};
use crate::scheduler::Scheduler;
use crate::utils::deterministic_rng::Pcg32;
use crate::weights::ParamStore;

/// Mask value for frames the pipeline must generate
pub const MASK_GENERATE: f32 = 255.0;
/// Mask value for frames supplied by the conditioning video
pub const MASK_KEEP: f32 = 0.0;

/// Conditioning video and its validity mask
#[derive(Debug, Clone)]
pub struct ConditioningPayload {
    /// `[1, 3, F, H, W]`, values in `[0, 1]`
    pub video: Tensor,
    /// `[1, 1, F, H, W]`, [`MASK_KEEP`] or [`MASK_GENERATE`]
    pub mask: Tensor,
    /// First conditioning frame, for the image-embedding branch
    pub clip_image: Option<RgbImage>,
    /// 1.0 for image conditioning, the denoise strength for video-to-video
    pub strength: f64,
}

/// One generation request as the backend sees it
#[derive(Debug, Clone)]
pub struct PipelineCall {
    pub prompt: String,
    pub negative_prompt: String,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub num_frames: usize,
    pub conditioning: Option<ConditioningPayload>,
}

/// Session-owned state lent to the backend for one call
pub struct PipelineContext<'a> {
    pub transformer: &'a ParamStore,
    pub scheduler: &'a Scheduler,
    pub generator: &'a mut Pcg32,
}

pub trait DiffusionPipeline {
    fn variant(&self) -> PipelineVariant;

    /// Frames as `[1, 3, num_frames, height, width]`, values in `[0, 1]`
    fn generate(&mut self, call: &PipelineCall, ctx: PipelineContext<'_>) -> Result<Tensor>;
}

/// Everything a factory needs to assemble a pipeline for a checkpoint
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub checkpoint: CheckpointHandle,
    pub variant: PipelineVariant,
    pub offload: OffloadPolicy,
    pub dtype: DType,
    pub device: Device,
}

pub trait PipelineFactory {
    fn build(&self, spec: &PipelineSpec) -> Result<Box<dyn DiffusionPipeline>>;
}

// =============================================================================
// Preview backend
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewPipelineFactory;

impl PipelineFactory for PreviewPipelineFactory {
    fn build(&self, spec: &PipelineSpec) -> Result<Box<dyn DiffusionPipeline>> {
        debug!(
            checkpoint = %spec.checkpoint.name,
            variant = ?spec.variant,
            offload = ?spec.offload,
            "Building preview pipeline"
        );
        Ok(Box::new(PreviewPipeline::new(
            spec.variant,
            spec.checkpoint.spatial_compression_ratio,
            spec.device.clone(),
        )))
    }
}

#[derive(Debug, Clone)]
pub struct PreviewPipeline {
    variant: PipelineVariant,
    /// Sampling happens at this fraction of the output resolution
    downscale: usize,
    device: Device,
}

impl PreviewPipeline {
    pub fn new(variant: PipelineVariant, downscale: usize, device: Device) -> Self {
        Self {
            variant,
            downscale: downscale.max(1),
            device,
        }
    }

    fn latent_size(&self, call: &PipelineCall) -> (usize, usize) {
        let s = self.downscale;
        if call.height % s == 0 && call.width % s == 0 {
            ((call.height / s).max(1), (call.width / s).max(1))
        } else {
            (call.height, call.width)
        }
    }

    /// Per-channel colour in [0, 1] derived from a prompt
    fn prompt_color(prompt: &str) -> [f32; 3] {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in prompt.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        let mut rng = Pcg32::from_seed(hash);
        [rng.next_f32(), rng.next_f32(), rng.next_f32()]
    }

    fn color_field(&self, color: [f32; 3], frames: usize, h: usize, w: usize) -> Result<Tensor> {
        Tensor::new(&color, &self.device)?
            .reshape((1, 3, 1, 1, 1))?
            .broadcast_as((1, 3, frames, h, w))?
            .contiguous()
    }

    /// `[1, C, F, H, W]` -> `[1, C, F, h, w]` by average pooling each frame
    fn shrink(&self, video: &Tensor, h: usize, w: usize) -> Result<Tensor> {
        let (b, c, f, full_h, full_w) = video.dims5()?;
        if (full_h, full_w) == (h, w) {
            return Ok(video.clone());
        }
        let frames = video
            .permute((0, 2, 1, 3, 4))?
            .reshape((b * f, c, full_h, full_w))?
            .avg_pool2d((full_h / h, full_w / w))?;
        frames.reshape((b, f, c, h, w))?.permute((0, 2, 1, 3, 4))?.contiguous()
    }

    /// `[1, C, F, h, w]` -> `[1, C, F, H, W]` nearest neighbour
    fn grow(&self, video: &Tensor, height: usize, width: usize) -> Result<Tensor> {
        let (b, c, f, h, w) = video.dims5()?;
        if (h, w) == (height, width) {
            return Ok(video.clone());
        }
        let frames = video
            .permute((0, 2, 1, 3, 4))?
            .reshape((b * f, c, h, w))?
            .upsample_nearest2d(height, width)?;
        frames
            .reshape((b, f, c, height, width))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()
    }
}

impl DiffusionPipeline for PreviewPipeline {
    fn variant(&self) -> PipelineVariant {
        self.variant
    }

    fn generate(&mut self, call: &PipelineCall, ctx: PipelineContext<'_>) -> Result<Tensor> {
        if call.num_frames == 0 || call.width == 0 || call.height == 0 {
            candle_core::bail!(
                "invalid output size {}x{}x{}",
                call.num_frames,
                call.width,
                call.height
            );
        }
        let (h, w) = self.latent_size(call);
        let frames = call.num_frames;

        // Classifier-free guidance on the prompt colours
        let cond = Self::prompt_color(&call.prompt);
        let uncond = Self::prompt_color(&call.negative_prompt);
        let g = call.guidance_scale as f32;
        let guided = std::array::from_fn(|i| (uncond[i] + g * (cond[i] - uncond[i])).clamp(0.0, 1.0));

        let texture = (ctx.generator.rand((1, 3, frames, h, w), &self.device)? - 0.5)?;
        let mut target = (self.color_field(guided, frames, h, w)? + (texture * 0.1)?)?;

        let mut strength = 1.0;
        if let Some(payload) = &call.conditioning {
            let video = self.shrink(&payload.video.to_dtype(DType::F32)?, h, w)?;
            let keep = (1.0 - (self.shrink(&payload.mask.to_dtype(DType::F32)?, h, w)? / MASK_GENERATE as f64)?)?
                .broadcast_as((1, 3, frames, h, w))?;
            target = ((&keep * &video)? + ((1.0 - &keep)? * &target)?)?;
            strength = payload.strength.clamp(0.0, 1.0);
            if strength < 1.0 {
                target = ((video * (1.0 - strength))? + (target * strength)?)?;
            }
        }

        let sigmas = ctx.scheduler.inference_sigmas(call.num_inference_steps.max(1));
        let skip = ((1.0 - strength) * (sigmas.len() - 1) as f64).floor() as usize;
        let sigmas = &sigmas[skip.min(sigmas.len() - 1)..];

        let noise = ctx.generator.randn((1, 3, frames, h, w), &self.device)?;
        let mut sample = (&target + (noise * sigmas[0])?)?;
        for pair in sigmas.windows(2) {
            let (sigma, next) = (pair[0], pair[1]);
            let ratio = if sigma > 0.0 { next / sigma } else { 0.0 };
            sample = (&target + ((sample - &target)? * ratio)?)?;
            if ctx.scheduler.kind().is_stochastic() && next > 0.0 {
                let jitter = ctx.generator.randn((1, 3, frames, h, w), &self.device)?;
                sample = (sample + (jitter * (next * 0.01))?)?;
            }
        }

        debug!(
            frames,
            steps = sigmas.len() - 1,
            params = ctx.transformer.len(),
            "Preview sampling finished"
        );
        self.grow(&sample.clamp(0f32, 1f32)?, call.height, call.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    fn call(frames: usize) -> PipelineCall {
        PipelineCall {
            prompt: "a red ball bouncing".into(),
            negative_prompt: String::new(),
            num_inference_steps: 4,
            guidance_scale: 7.0,
            width: 32,
            height: 16,
            num_frames: frames,
            conditioning: None,
        }
    }

    fn run(pipeline: &mut PreviewPipeline, call: &PipelineCall, seed: u64) -> Tensor {
        let params = ParamStore::new();
        let scheduler = Scheduler::default();
        let mut generator = Pcg32::from_seed(seed);
        pipeline
            .generate(
                call,
                PipelineContext {
                    transformer: &params,
                    scheduler: &scheduler,
                    generator: &mut generator,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_output_shape_and_range() {
        let mut pipeline = PreviewPipeline::new(PipelineVariant::Plain, 8, Device::Cpu);
        let video = run(&mut pipeline, &call(5), 43);
        assert_eq!(video.dims(), &[1, 3, 5, 16, 32]);
        let min = video.min_all().unwrap().to_scalar::<f32>().unwrap();
        let max = video.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= 0.0 && max <= 1.0);
    }

    #[test]
    fn test_seed_is_deterministic() {
        let mut pipeline = PreviewPipeline::new(PipelineVariant::Plain, 8, Device::Cpu);
        let a = run(&mut pipeline, &call(3), 7).flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = run(&mut pipeline, &call(3), 7).flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = run(&mut pipeline, &call(3), 8).flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_kept_frames_follow_conditioning() {
        let mut pipeline = PreviewPipeline::new(PipelineVariant::Inpaint, 8, Device::Cpu);
        let mut call = call(5);
        let video = Tensor::ones((1, 3, 5, 16, 32), DType::F32, &Device::Cpu).unwrap();
        let mut mask = vec![MASK_GENERATE; 5];
        mask[0] = MASK_KEEP;
        let mask = Tensor::from_vec(mask, (1, 1, 5, 1, 1), &Device::Cpu)
            .unwrap()
            .broadcast_as((1, 1, 5, 16, 32))
            .unwrap()
            .contiguous()
            .unwrap();
        call.conditioning = Some(ConditioningPayload {
            video,
            mask,
            clip_image: None,
            strength: 1.0,
        });

        let out = run(&mut pipeline, &call, 1);
        let first = out.i((0, .., 0)).unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((first - 1.0).abs() < 1e-4, "first frame mean {first}");
    }
}
