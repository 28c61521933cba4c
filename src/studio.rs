//! Front-end facing entry point tying the session, validator, orchestrator and
//! output directory together. Every call returns a status string instead of
//! failing, so a form or CLI can show it as-is.

use candle_core::Device;
use tracing::{info, warn};

use crate::config::StudioConfig;
use crate::error::{Result, StudioError};
use crate::materialize::{Artifact, OutputMaterializer};
use crate::orchestrator::{DeviceReclaimer, MemoryReclaimer, Orchestrator};
use crate::pipeline::PipelineFactory;
use crate::remote::RemoteProxy;
use crate::session::ModelSession;
use crate::validator::{GenerationRequest, RawRequest, RequestValidator};

pub const SUCCESS_STATUS: &str = "Success";

/// Outcome of one generate call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub artifact: Option<Artifact>,
    pub status: String,
    pub seed: Option<u64>,
}

impl GenerationResponse {
    fn success(artifact: Artifact, seed: Option<u64>) -> Self {
        Self {
            artifact: Some(artifact),
            status: SUCCESS_STATUS.to_string(),
            seed,
        }
    }

    fn failure(error: &StudioError) -> Self {
        let status = match error {
            StudioError::Remote(message) => message.clone(),
            other => format!("Error. error information is {other}"),
        };
        Self {
            artifact: None,
            status,
            seed: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.artifact.is_some()
    }
}

/// Selector lists shown to the user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetListing {
    pub checkpoints: Vec<String>,
    pub base_weights: Vec<String>,
    pub lora_weights: Vec<String>,
    pub motion_modules: Vec<String>,
}

pub struct Studio<R: MemoryReclaimer = DeviceReclaimer> {
    session: ModelSession,
    orchestrator: Orchestrator<R>,
    validator: RequestValidator,
    materializer: OutputMaterializer,
    remote: Option<RemoteProxy>,
}

impl Studio<DeviceReclaimer> {
    /// A studio writing into a fresh session directory under the output root
    pub fn new(config: &StudioConfig, device: Device, factory: Box<dyn PipelineFactory>) -> Result<Self> {
        let session = ModelSession::new(config, device, factory);
        let materializer = OutputMaterializer::new(config.new_session_dir());
        let mut studio = Self::from_parts(session, Orchestrator::default(), materializer);
        if let Some(remote) = &config.remote {
            studio.remote = Some(RemoteProxy::new(remote.clone())?);
        }
        Ok(studio)
    }
}

impl<R: MemoryReclaimer> Studio<R> {
    pub fn from_parts(session: ModelSession, orchestrator: Orchestrator<R>, materializer: OutputMaterializer) -> Self {
        Self {
            session,
            orchestrator,
            validator: RequestValidator::new(),
            materializer,
            remote: None,
        }
    }

    pub fn with_remote(mut self, proxy: RemoteProxy) -> Self {
        self.remote = Some(proxy);
        self
    }

    pub fn session(&self) -> &ModelSession {
        &self.session
    }

    pub fn orchestrator(&self) -> &Orchestrator<R> {
        &self.orchestrator
    }

    pub fn materializer(&self) -> &OutputMaterializer {
        &self.materializer
    }

    /// Rescan the model directories
    pub fn list_assets(&self) -> AssetListing {
        let registry = self.session.registry();
        AssetListing {
            checkpoints: registry.list_checkpoints(),
            base_weights: registry.list_base_weights(),
            lora_weights: registry.list_lora_weights(),
            motion_modules: registry.list_motion_modules(),
        }
    }

    pub fn load_checkpoint(&mut self, name: &str) -> Result<()> {
        self.session.load_checkpoint(name)
    }

    /// Generate locally and report the outcome as a status
    pub fn generate(&mut self, raw: &RawRequest) -> GenerationResponse {
        match self.try_generate(raw) {
            Ok((artifact, request)) => GenerationResponse::success(artifact, Some(request.seed)),
            Err(e) => {
                warn!(error = %e, kind = ?e.kind(), "Generation request failed");
                GenerationResponse::failure(&e)
            }
        }
    }

    /// Generate locally, returning the artifact and the request that produced it
    pub fn try_generate(&mut self, raw: &RawRequest) -> Result<(Artifact, GenerationRequest)> {
        if self.session.checkpoint().is_none() {
            return Err(StudioError::NoCheckpoint);
        }
        self.session
            .sync_adapters(&raw.base_weights, &raw.lora, raw.lora_strength)?;
        let request = self.validator.validate(raw, self.session.checkpoint())?;
        let video = self.orchestrator.run(&mut self.session, &request)?;

        self.orchestrator.mark_materializing();
        match self.materializer.materialize(&request, &video.frames) {
            Ok(artifact) => {
                self.orchestrator.mark_done();
                info!(
                    path = %artifact.path.display(),
                    frames = video.num_frames(),
                    seed = video.seed,
                    "Generation finished"
                );
                Ok((artifact, request))
            }
            Err(e) => {
                self.orchestrator.mark_failed();
                Err(e)
            }
        }
    }

    /// Forward the request to the configured endpoint
    pub fn generate_remote(&self, raw: &RawRequest) -> GenerationResponse {
        let Some(proxy) = &self.remote else {
            return GenerationResponse::failure(&StudioError::configuration(
                "No remote endpoint configured.",
            ));
        };
        match proxy.generate(raw, &self.materializer) {
            Ok(artifact) => GenerationResponse::success(artifact, None),
            Err(e) => {
                warn!(error = %e, "Remote generation failed");
                GenerationResponse::failure(&e)
            }
        }
    }
}
