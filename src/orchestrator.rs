//! Running a validated request against a session.
//!
//! Each attempt walks `Idle -> WeightsPreparing -> Sampling -> WeightsRestoring`
//! and hands the frames to the caller for materializing. Accelerator memory is
//! reclaimed before and after every attempt, and the LoRA merge is undone on
//! every exit path.

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use std::fmt;
use std::path::Path;
use tracing::{debug, error, info};

use crate::checkpoint::{CheckpointHandle, PipelineVariant};
use crate::error::{Result, StudioError};
use crate::long_video::{blend_overlap, check_chunk, plan_chunks, tail_frames};
use crate::media::{image_to_video_conditioning, load_image, read_video_frames, tensor_to_frames, video_to_video_conditioning};
use crate::pipeline::{ConditioningPayload, MASK_GENERATE, PipelineCall};
use crate::session::{GenerationScope, ModelSession};
use crate::utils::deterministic_rng::Pcg32;
use crate::validator::{Conditioning, GenerationMode, GenerationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Idle,
    WeightsPreparing,
    Sampling,
    WeightsRestoring,
    Materializing,
    Done,
    Failed,
}

impl fmt::Display for GenerationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frees cached accelerator memory between attempts
pub trait MemoryReclaimer {
    fn reclaim(&self, device: &Device);
}

/// Waits for queued device work so freed buffers are actually released
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceReclaimer;

impl MemoryReclaimer for DeviceReclaimer {
    fn reclaim(&self, device: &Device) {
        if let Err(e) = device.synchronize() {
            debug!(error = %e, "Device synchronize failed during reclaim");
        }
    }
}

/// Frames produced by one attempt
#[derive(Debug, Clone)]
pub struct GeneratedVideo {
    /// `[1, 3, F, H, W]`, values in `[0, 1]`
    pub frames: Tensor,
    pub seed: u64,
    pub pipeline_calls: usize,
}

impl GeneratedVideo {
    pub fn num_frames(&self) -> usize {
        self.frames.dim(2).unwrap_or(0)
    }
}

pub struct Orchestrator<R: MemoryReclaimer = DeviceReclaimer> {
    reclaimer: R,
    phase: GenerationPhase,
}

impl Default for Orchestrator<DeviceReclaimer> {
    fn default() -> Self {
        Self::new(DeviceReclaimer)
    }
}

impl<R: MemoryReclaimer> Orchestrator<R> {
    pub fn new(reclaimer: R) -> Self {
        Self {
            reclaimer,
            phase: GenerationPhase::Idle,
        }
    }

    pub fn phase(&self) -> GenerationPhase {
        self.phase
    }

    pub fn reclaimer(&self) -> &R {
        &self.reclaimer
    }

    fn enter(&mut self, phase: GenerationPhase) {
        debug!(from = %self.phase, to = %phase, "Generation phase");
        self.phase = phase;
    }

    /// Materializing happens outside; the caller reports it back here
    pub fn mark_materializing(&mut self) {
        self.enter(GenerationPhase::Materializing);
    }

    pub fn mark_done(&mut self) {
        self.enter(GenerationPhase::Done);
    }

    pub fn mark_failed(&mut self) {
        self.enter(GenerationPhase::Failed);
    }

    /// Sample the frames for `request`; the session's weights are unchanged afterwards
    pub fn run(&mut self, session: &mut ModelSession, request: &GenerationRequest) -> Result<GeneratedVideo> {
        let device = session.device().clone();
        self.phase = GenerationPhase::Idle;
        self.reclaimer.reclaim(&device);

        let result = self.attempt(session, request, &device);
        if let Err(e) = &result {
            error!(error = %e, "Generation failed");
            if self.phase != GenerationPhase::Failed {
                self.enter(GenerationPhase::Failed);
            }
        }
        self.reclaimer.reclaim(&device);
        result
    }

    fn attempt(
        &mut self,
        session: &mut ModelSession,
        request: &GenerationRequest,
        device: &Device,
    ) -> Result<GeneratedVideo> {
        self.enter(GenerationPhase::WeightsPreparing);
        session.select_scheduler(request.sampler)?;
        let mut scope = session.merge_lora_for_generation()?;

        self.enter(GenerationPhase::Sampling);
        let mut generator = Pcg32::from_seed(request.seed);
        info!(
            checkpoint = %scope.checkpoint().name,
            sampler = %request.sampler,
            frames = request.num_frames,
            width = request.width,
            height = request.height,
            seed = request.seed,
            lora = scope.lora_merged(),
            "Sampling"
        );

        let sampled = match request.mode {
            GenerationMode::LongVideo {
                chunk_frames,
                overlap_frames,
            } => generate_long(&mut scope, request, chunk_frames, overlap_frames, &mut generator, device),
            GenerationMode::Image | GenerationMode::Video => {
                generate_single(&mut scope, request, &mut generator, device)
            }
        };

        if sampled.is_err() {
            self.enter(GenerationPhase::Failed);
        } else {
            self.enter(GenerationPhase::WeightsRestoring);
        }
        scope.restore();

        let (frames, pipeline_calls) = sampled?;
        Ok(GeneratedVideo {
            frames,
            seed: request.seed,
            pipeline_calls,
        })
    }
}

fn base_call(request: &GenerationRequest, num_frames: usize, conditioning: Option<ConditioningPayload>) -> PipelineCall {
    PipelineCall {
        prompt: request.prompt.clone(),
        negative_prompt: request.negative_prompt.clone(),
        num_inference_steps: request.num_inference_steps,
        guidance_scale: request.guidance_scale,
        width: request.width,
        height: request.height,
        num_frames,
        conditioning,
    }
}

/// All frames generated, nothing given; what an inpainting pipeline expects
/// when no image is supplied
fn unconditioned(num_frames: usize, width: usize, height: usize, device: &Device) -> Result<ConditioningPayload> {
    Ok(ConditioningPayload {
        video: Tensor::zeros((1, 3, num_frames, height, width), DType::F32, device)?,
        mask: (Tensor::ones((1, 1, num_frames, height, width), DType::F32, device)? * MASK_GENERATE as f64)?,
        clip_image: None,
        strength: 1.0,
    })
}

fn load_end_image(path: Option<&Path>) -> Result<Option<Vec<RgbImage>>> {
    path.map(|p| load_image(p).map(|img| vec![img])).transpose()
}

fn sample(
    scope: &mut GenerationScope<'_>,
    call: &PipelineCall,
    generator: &mut Pcg32,
) -> Result<Tensor> {
    let frames = scope
        .generate(call, generator)
        .and_then(|frames| {
            check_chunk(&frames, call.num_frames)?;
            frames.to_dtype(DType::F32)
        })
        .map_err(|e| StudioError::Generation(e.to_string()))?;
    Ok(frames)
}

fn conditioning_for(
    checkpoint: &CheckpointHandle,
    request: &GenerationRequest,
    num_frames: usize,
    device: &Device,
) -> Result<Option<ConditioningPayload>> {
    let payload = match &request.conditioning {
        Conditioning::Video { path, denoise_strength } => Some(video_to_video_conditioning(
            &read_video_frames(path)?,
            num_frames,
            request.width,
            request.height,
            *denoise_strength,
            device,
        )?),
        Conditioning::Image { start, end } => {
            let end = load_end_image(end.as_deref())?;
            Some(image_to_video_conditioning(
                &[load_image(start)?],
                end.as_deref(),
                num_frames,
                request.width,
                request.height,
                device,
            )?)
        }
        Conditioning::None if checkpoint.variant() == PipelineVariant::Inpaint => {
            Some(unconditioned(num_frames, request.width, request.height, device)?)
        }
        Conditioning::None => None,
    };
    Ok(payload)
}

fn generate_single(
    scope: &mut GenerationScope<'_>,
    request: &GenerationRequest,
    generator: &mut Pcg32,
    device: &Device,
) -> Result<(Tensor, usize)> {
    let conditioning = conditioning_for(scope.checkpoint(), request, request.num_frames, device)?;
    let call = base_call(request, request.num_frames, conditioning);
    Ok((sample(scope, &call, generator)?, 1))
}

fn generate_long(
    scope: &mut GenerationScope<'_>,
    request: &GenerationRequest,
    chunk_frames: usize,
    overlap_frames: usize,
    generator: &mut Pcg32,
    device: &Device,
) -> Result<(Tensor, usize)> {
    let plans = plan_chunks(
        request.num_frames,
        chunk_frames,
        overlap_frames,
        scope.checkpoint().temporal_compression_ratio,
    );
    if plans.is_empty() {
        return Err(StudioError::configuration(
            "The long video plan is empty; check the overlap and partial video length.",
        ));
    }

    let (mut start_frames, end_frames) = match &request.conditioning {
        Conditioning::Image { start, end } => (Some(vec![load_image(start)?]), load_end_image(end.as_deref())?),
        Conditioning::None => (None, None),
        Conditioning::Video { .. } => {
            return Err(StudioError::validation(
                "Video to video is not supported for long video generation.",
            ));
        }
    };

    let mut video: Option<Tensor> = None;
    for plan in &plans {
        debug!(
            chunk = plan.index,
            start_frame = plan.start_frame,
            frames = plan.num_frames,
            is_final = plan.is_final,
            "Generating chunk"
        );
        let end = if plan.is_final { end_frames.as_deref() } else { None };
        let conditioning = match &start_frames {
            Some(start) => image_to_video_conditioning(start, end, plan.num_frames, request.width, request.height, device)?,
            None => unconditioned(plan.num_frames, request.width, request.height, device)?,
        };
        let call = base_call(request, plan.num_frames, Some(conditioning));
        let chunk = sample(scope, &call, generator)?;

        let merged = match video.take() {
            None => chunk,
            Some(previous) => blend_overlap(&previous, &chunk, plan.overlap)?,
        };
        if !plan.is_final {
            start_frames = Some(tensor_to_frames(&tail_frames(&merged, overlap_frames)?)?);
        }
        video = Some(merged);
    }

    let frames = video.ok_or_else(|| StudioError::Generation("No chunk was generated".into()))?;
    let produced = frames.dim(2)?;
    if produced != request.num_frames {
        info!(
            requested = request.num_frames,
            produced,
            "Long video length rounded to the temporal compression ratio"
        );
    }
    Ok((frames, plans.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingReclaimer(Cell<usize>);

    impl MemoryReclaimer for CountingReclaimer {
        fn reclaim(&self, _device: &Device) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_failure_without_checkpoint_reclaims_memory() {
        use crate::config::StudioConfig;
        use crate::pipeline::PreviewPipelineFactory;
        use crate::validator::{RawRequest, RequestValidator};
        use crate::checkpoint::{TransformerConfig, VaeConfig};

        let config = StudioConfig::with_base_dir("/nonexistent");
        let mut session = ModelSession::new(&config, Device::Cpu, Box::new(PreviewPipelineFactory));
        let handle = CheckpointHandle::from_configs("/x", &TransformerConfig::default(), &VaeConfig::default());
        let request = RequestValidator::new()
            .validate(&RawRequest::new("x"), Some(&handle))
            .unwrap();

        let mut orchestrator = Orchestrator::new(CountingReclaimer::default());
        let err = orchestrator.run(&mut session, &request).unwrap_err();
        assert!(matches!(err, StudioError::NoCheckpoint));
        assert_eq!(orchestrator.phase(), GenerationPhase::Failed);
        assert_eq!(orchestrator.reclaimer().0.get(), 2);
    }

    #[test]
    fn test_unconditioned_payload_generates_everything() {
        let payload = unconditioned(3, 16, 16, &Device::Cpu).unwrap();
        let mask = payload.mask.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(mask.iter().all(|&m| m == MASK_GENERATE));
        assert_eq!(payload.video.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }
}
