//! Candle-CogVideo: orchestration for CogVideoX-Fun style video diffusion on Candle.
//!
//! The crate drives a diffusion backend rather than implementing one. It owns
//! the pieces around it: discovering checkpoints and personalised weights,
//! merging and unmerging LoRA adapters, validating requests, stitching long
//! videos out of overlapping chunks, writing results and proxying to a hosted
//! endpoint.

pub mod buckets;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod loader;
pub mod long_video;
pub mod lora;
pub mod materialize;
pub mod media;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod studio;
pub mod utils;
pub mod validator;
pub mod weights;

pub use checkpoint::{CheckpointHandle, CheckpointModality, PipelineVariant};
pub use config::{RemoteConfig, StudioConfig};
pub use error::{ErrorKind, Result, StudioError};
pub use materialize::{Artifact, ArtifactKind, OutputMaterializer};
pub use orchestrator::{GeneratedVideo, GenerationPhase, MemoryReclaimer, Orchestrator};
pub use pipeline::{DiffusionPipeline, PipelineCall, PipelineFactory, PreviewPipelineFactory};
pub use registry::AssetRegistry;
pub use remote::RemoteProxy;
pub use scheduler::SamplerKind;
pub use session::ModelSession;
pub use studio::{GenerationResponse, Studio};
pub use validator::{GenerationMethod, GenerationRequest, RawRequest, RequestValidator, ResizeMode};
