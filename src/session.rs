//! The loaded checkpoint and the adapters applied to it.
//!
//! A [`ModelSession`] holds at most one live pipeline. Loading a checkpoint
//! builds every component first and only then swaps it in, so a failed load
//! leaves the previous model usable. LoRA adapters are staged by path and
//! merged only inside a [`GenerationScope`], which puts the original
//! parameters back when it is restored or dropped.

use candle_core::{DType, Device, Tensor};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointHandle, CheckpointLayout, OffloadPolicy};
use crate::config::StudioConfig;
use crate::error::{Result, StudioError};
use crate::loader::{LoaderError, WeightLoader, resolve_component_files};
use crate::lora::{self, LoraWeights, MergedLora};
use crate::pipeline::{DiffusionPipeline, PipelineCall, PipelineContext, PipelineFactory, PipelineSpec};
use crate::registry::{AssetRegistry, is_none_selection};
use crate::scheduler::{SamplerKind, Scheduler, SchedulerConfig};
use crate::utils::deterministic_rng::Pcg32;
use crate::weights::{OverlayReport, ParamStore};

/// A LoRA recorded for the next generations, not yet merged
#[derive(Debug, Clone, PartialEq)]
pub struct StagedLora {
    /// Selection as given, used to detect changes
    pub name: String,
    pub path: PathBuf,
    pub strength: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterState {
    /// Last applied base-weight archive
    pub base_weights: Option<String>,
    pub lora: Option<StagedLora>,
}

struct LoadedModel {
    handle: CheckpointHandle,
    transformer: ParamStore,
    scheduler_config: SchedulerConfig,
    scheduler: Scheduler,
    pipeline: Box<dyn DiffusionPipeline>,
}

pub struct ModelSession {
    registry: AssetRegistry,
    factory: Box<dyn PipelineFactory>,
    device: Device,
    dtype: DType,
    offload: OffloadPolicy,
    model: Option<LoadedModel>,
    adapters: AdapterState,
}

impl ModelSession {
    pub fn new(config: &StudioConfig, device: Device, factory: Box<dyn PipelineFactory>) -> Self {
        Self {
            registry: AssetRegistry::new(config),
            factory,
            device,
            dtype: config.weight_precision.dtype(),
            offload: OffloadPolicy::for_low_memory(config.low_gpu_memory_mode),
            model: None,
            adapters: AdapterState::default(),
        }
    }

    /// A session with one checkpoint loaded up front, for deployments that
    /// serve a fixed model.
    pub fn with_checkpoint(
        config: &StudioConfig,
        device: Device,
        factory: Box<dyn PipelineFactory>,
        checkpoint: &str,
    ) -> Result<Self> {
        let mut session = Self::new(config, device, factory);
        session.load_checkpoint(checkpoint)?;
        if session.model.is_none() {
            return Err(StudioError::NoCheckpoint);
        }
        Ok(session)
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn offload_policy(&self) -> OffloadPolicy {
        self.offload
    }

    pub fn checkpoint(&self) -> Option<&CheckpointHandle> {
        self.model.as_ref().map(|m| &m.handle)
    }

    pub fn adapters(&self) -> &AdapterState {
        &self.adapters
    }

    pub fn transformer(&self) -> Option<&ParamStore> {
        self.model.as_ref().map(|m| &m.transformer)
    }

    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.model.as_ref().map(|m| &m.scheduler)
    }

    /// Load a checkpoint by registry name or path. `"none"` keeps the current one.
    pub fn load_checkpoint(&mut self, name: &str) -> Result<()> {
        if is_none_selection(name) {
            return Ok(());
        }
        let path = self.registry.checkpoint_path(name);
        info!(checkpoint = %path.display(), offload = ?self.offload, "Loading checkpoint");

        let model = self
            .build_model(&path)
            .map_err(|source| StudioError::model_load(&path, source))?;

        info!(
            checkpoint = %model.handle.name,
            modality = ?model.handle.modality,
            params = model.transformer.len(),
            "Checkpoint loaded"
        );
        // Fresh transformer weights: no base-weight overlay applies any more
        self.adapters.base_weights = None;
        self.model = Some(model);
        Ok(())
    }

    fn build_model(&self, path: &std::path::Path) -> std::result::Result<LoadedModel, LoaderError> {
        let layout = CheckpointLayout::new(path);
        let transformer_config = layout.read_transformer_config()?;
        let vae_config = layout.read_vae_config()?;
        let scheduler_config = layout.read_scheduler_config()?;
        let handle = CheckpointHandle::from_configs(path, &transformer_config, &vae_config);

        // The VAE is decoded by the backend; only its presence is checked here
        let vae_files = resolve_component_files(layout.vae_dir())?;
        debug!(files = vae_files.len(), "VAE weights found");

        let transformer = WeightLoader::new(self.device.clone(), self.dtype)
            .add_prefix_mapping("transformer.", "")
            .load_directory(layout.transformer_dir())?;
        let transformer = ParamStore::from(transformer);

        let spec = PipelineSpec {
            checkpoint: handle.clone(),
            variant: handle.variant(),
            offload: self.offload,
            dtype: self.dtype,
            device: self.device.clone(),
        };
        let pipeline = self.factory.build(&spec)?;

        Ok(LoadedModel {
            scheduler: Scheduler::from_config(SamplerKind::Euler, &scheduler_config),
            handle,
            transformer,
            scheduler_config,
            pipeline,
        })
    }

    /// Overlay a base-weight archive onto the transformer.
    ///
    /// `"none"` only clears the recorded selection; parameters already
    /// overlaid stay as they are until the next checkpoint load.
    pub fn apply_base_weights(&mut self, name: &str) -> Result<Option<OverlayReport>> {
        let Some(model) = self.model.as_mut() else {
            return Err(StudioError::NoCheckpoint);
        };
        if is_none_selection(name) {
            self.adapters.base_weights = None;
            return Ok(None);
        }

        let path = self.registry.base_weights_path(name);
        info!(weights = %path.display(), "Applying base weights");
        let archive = WeightLoader::new(self.device.clone(), self.dtype)
            .load_file(&path)
            .map_err(|source| StudioError::model_load(&path, source))?;
        let report = model
            .transformer
            .overlay(archive)
            .map_err(|source| StudioError::model_load(&path, source))?;

        if !report.unknown.is_empty() {
            warn!(
                count = report.unknown.len(),
                first = %report.unknown[0],
                "Base weights contain keys unknown to the transformer"
            );
        }
        info!(applied = report.applied.len(), untouched = report.untouched, "Base weights applied");
        self.adapters.base_weights = Some(name.to_string());
        Ok(Some(report))
    }

    /// Record a LoRA for later generations; `"none"` clears it
    pub fn stage_lora(&mut self, name: &str, strength: f64) {
        if is_none_selection(name) {
            if self.adapters.lora.take().is_some() {
                debug!("LoRA unstaged");
            }
            return;
        }
        let path = self.registry.lora_path(name);
        debug!(lora = %path.display(), strength, "LoRA staged");
        self.adapters.lora = Some(StagedLora {
            name: name.to_string(),
            path,
            strength,
        });
    }

    /// Bring the adapters in line with a request's selections, touching only
    /// what changed
    pub fn sync_adapters(&mut self, base_weights: &str, lora: &str, strength: f64) -> Result<()> {
        let wanted_base = (!is_none_selection(base_weights)).then(|| base_weights.to_string());
        if wanted_base != self.adapters.base_weights {
            self.apply_base_weights(base_weights)?;
        }

        let staged = self.adapters.lora.as_ref();
        let unchanged = match staged {
            None => is_none_selection(lora),
            Some(s) => s.name == lora && s.strength == strength,
        };
        if !unchanged {
            self.stage_lora(lora, strength);
        }
        Ok(())
    }

    /// Rebuild the scheduler for `kind` from the checkpoint's configuration
    pub fn select_scheduler(&mut self, kind: SamplerKind) -> Result<()> {
        let model = self.model.as_mut().ok_or(StudioError::NoCheckpoint)?;
        if model.scheduler.kind() != kind {
            debug!(from = %model.scheduler.kind(), to = %kind, "Switching sampler");
        }
        model.scheduler = Scheduler::from_config(kind, &model.scheduler_config);
        Ok(())
    }

    /// Merge the staged LoRA (if any) and hand out the scope that undoes it
    pub fn merge_lora_for_generation(&mut self) -> Result<GenerationScope<'_>> {
        let model = self.model.as_mut().ok_or(StudioError::NoCheckpoint)?;

        let merged = match &self.adapters.lora {
            None => None,
            Some(staged) => {
                let weights = LoraWeights::load(&staged.path, &model.transformer, &self.device)
                    .map_err(|source| StudioError::model_load(&staged.path, source))?;
                let merged = lora::merge(&mut model.transformer, &weights, staged.strength)?;
                info!(
                    lora = %staged.name,
                    strength = staged.strength,
                    layers = merged.len(),
                    "LoRA merged"
                );
                Some(merged)
            }
        };

        Ok(GenerationScope {
            model,
            merged,
            restored: false,
        })
    }
}

/// Weights as they are for one generation attempt.
///
/// `restore` puts back the pre-merge parameters; dropping the scope without
/// calling it does the same.
pub struct GenerationScope<'a> {
    model: &'a mut LoadedModel,
    merged: Option<MergedLora>,
    restored: bool,
}

impl GenerationScope<'_> {
    pub fn checkpoint(&self) -> &CheckpointHandle {
        &self.model.handle
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.model.scheduler
    }

    pub fn lora_merged(&self) -> bool {
        self.merged.is_some()
    }

    pub fn generate(&mut self, call: &PipelineCall, generator: &mut Pcg32) -> candle_core::Result<Tensor> {
        let model = &mut *self.model;
        model.pipeline.generate(
            call,
            PipelineContext {
                transformer: &model.transformer,
                scheduler: &model.scheduler,
                generator,
            },
        )
    }

    pub fn restore(mut self) {
        self.restore_weights();
    }

    fn restore_weights(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        if let Some(merged) = self.merged.take() {
            lora::restore(&mut self.model.transformer, merged);
            info!("LoRA unmerged");
        }
    }
}

impl Drop for GenerationScope<'_> {
    fn drop(&mut self) {
        if !self.restored {
            if self.merged.is_some() {
                warn!("Generation scope dropped without restore; restoring weights");
            }
            self.restore_weights();
        }
    }
}
