//! CogVideoX-Fun command line front-end
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin cogvideo-fun -- list --base-dir .
//!
//! cargo run --release --bin cogvideo-fun -- generate \
//!     --checkpoint CogVideoX-Fun-V1.1-5b-InP \
//!     --prompt "A young woman with beautiful face, smiling" \
//!     --start-image asset/1.png \
//!     --num-frames 49
//!
//! EAS_URL=https://... EAS_TOKEN=... cargo run --bin cogvideo-fun -- remote --prompt "..."
//! ```

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use candle_cogvideo::config::{ENV_REMOTE_TOKEN, ENV_REMOTE_URL, GenerationDefaults, RemoteConfig, WeightPrecision};
use candle_cogvideo::{
    GenerationMethod, ModelSession, Orchestrator, OutputMaterializer, PreviewPipelineFactory, RawRequest,
    RemoteProxy, ResizeMode, Studio, StudioConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate videos with CogVideoX-Fun checkpoints")]
struct Cli {
    /// Root holding `models/` and `samples/`; defaults to COGVIDEO_BASE_DIR or the current directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List checkpoints and personalised weights
    List,
    /// Generate locally
    Generate {
        /// Checkpoint directory name or path
        #[arg(long)]
        checkpoint: String,

        /// Use CPU instead of CUDA
        #[arg(long)]
        cpu: bool,

        /// Offload layers sequentially to save accelerator memory
        #[arg(long)]
        low_gpu_memory: bool,

        /// Weight precision: f32, f16 or bf16
        #[arg(long)]
        precision: Option<WeightPrecision>,

        #[command(flatten)]
        request: RequestArgs,
    },
    /// Forward the request to a hosted endpoint
    Remote {
        #[arg(long, env = ENV_REMOTE_URL)]
        url: String,

        #[arg(long, env = ENV_REMOTE_TOKEN, hide_env_values = true)]
        token: Option<String>,

        #[arg(long, default_value_t = RemoteConfig::DEFAULT_TIMEOUT_SECS)]
        timeout_secs: u64,

        #[command(flatten)]
        request: RequestArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct RequestArgs {
    #[arg(short, long)]
    prompt: String,

    #[arg(long)]
    negative_prompt: Option<String>,

    /// Base weights archive, or "none"
    #[arg(long, default_value = "none")]
    base_weights: String,

    /// LoRA archive, or "none"
    #[arg(long, default_value = "none")]
    lora: String,

    #[arg(long, default_value_t = GenerationDefaults::default().lora_strength)]
    lora_strength: f64,

    /// Euler, Euler A, DPM++, PNDM, DDIM_Cog or DDIM_Origin
    #[arg(long, default_value = "Euler")]
    sampler: String,

    #[arg(long, default_value_t = GenerationDefaults::default().num_inference_steps)]
    steps: usize,

    /// Derive width and height from the start image or reference video
    #[arg(long)]
    resize_from_reference: bool,

    #[arg(long, default_value_t = GenerationDefaults::default().width)]
    width: usize,

    #[arg(long, default_value_t = GenerationDefaults::default().height)]
    height: usize,

    #[arg(long, default_value_t = GenerationDefaults::default().base_resolution)]
    base_resolution: usize,

    /// "Video Generation", "Image Generation" or "Long Video Generation"
    #[arg(long, default_value = "Video Generation")]
    method: GenerationMethod,

    #[arg(long, default_value_t = GenerationDefaults::default().num_frames)]
    num_frames: usize,

    #[arg(long, default_value_t = GenerationDefaults::default().overlap_frames)]
    overlap_frames: usize,

    #[arg(long, default_value_t = GenerationDefaults::default().chunk_frames)]
    chunk_frames: usize,

    #[arg(long, default_value_t = GenerationDefaults::default().guidance_scale)]
    guidance_scale: f64,

    #[arg(long)]
    start_image: Option<PathBuf>,

    #[arg(long)]
    end_image: Option<PathBuf>,

    /// GIF or directory of frames for video-to-video
    #[arg(long)]
    reference_video: Option<PathBuf>,

    #[arg(long, default_value_t = GenerationDefaults::default().denoise_strength)]
    denoise_strength: f64,

    /// Integer seed, or -1 for a random one
    #[arg(long, default_value = "43", allow_hyphen_values = true)]
    seed: String,
}

impl RequestArgs {
    fn into_raw(self) -> RawRequest {
        let mut raw = RawRequest::new(self.prompt);
        if let Some(negative) = self.negative_prompt {
            raw.negative_prompt = negative;
        }
        raw.base_weights = self.base_weights;
        raw.lora = self.lora;
        raw.lora_strength = self.lora_strength;
        raw.sampler = self.sampler;
        raw.num_inference_steps = self.steps;
        raw.resize_mode = if self.resize_from_reference {
            ResizeMode::FromReference
        } else {
            ResizeMode::Fixed
        };
        raw.width = self.width;
        raw.height = self.height;
        raw.base_resolution = self.base_resolution;
        raw.method = self.method;
        raw.num_frames = self.num_frames;
        raw.overlap_frames = self.overlap_frames;
        raw.chunk_frames = self.chunk_frames;
        raw.guidance_scale = self.guidance_scale;
        raw.start_image = self.start_image;
        raw.end_image = self.end_image;
        raw.reference_video = self.reference_video;
        raw.denoise_strength = self.denoise_strength;
        raw.seed = self.seed;
        raw
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_cogvideo=info".parse()?)
                .add_directive("cogvideo_fun=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = StudioConfig::from_env().context("Invalid environment configuration")?;
    if let Some(base) = &cli.base_dir {
        let remote = config.remote.take();
        let (low_memory, precision) = (config.low_gpu_memory_mode, config.weight_precision);
        config = StudioConfig::with_base_dir(base).with_low_gpu_memory_mode(low_memory);
        config.weight_precision = precision;
        config.remote = remote;
    }

    match cli.command {
        Command::List => {
            let studio = Studio::new(&config, Device::Cpu, Box::new(PreviewPipelineFactory))?;
            let listing = studio.list_assets();
            print_section("Checkpoints", &listing.checkpoints);
            print_section("Base weights", &listing.base_weights);
            print_section("LoRA weights", &listing.lora_weights);
            print_section("Motion modules", &listing.motion_modules);
        }
        Command::Generate {
            checkpoint,
            cpu,
            low_gpu_memory,
            precision,
            request,
        } => {
            if low_gpu_memory {
                config.low_gpu_memory_mode = true;
            }
            if let Some(precision) = precision {
                config.weight_precision = precision;
            }
            let device = select_device(cpu);
            let session = ModelSession::with_checkpoint(&config, device, Box::new(PreviewPipelineFactory), &checkpoint)
                .with_context(|| format!("Failed to load checkpoint {checkpoint}"))?;
            let materializer = OutputMaterializer::new(config.new_session_dir());
            let mut studio = Studio::from_parts(session, Orchestrator::default(), materializer);

            let response = studio.generate(&request.into_raw());
            report(response.status, response.artifact.map(|a| a.path))?;
        }
        Command::Remote {
            url,
            token,
            timeout_secs,
            request,
        } => {
            let mut remote = RemoteConfig::new(url);
            remote.timeout_secs = timeout_secs;
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                remote = remote.with_token(token);
            }
            let proxy = RemoteProxy::new(remote)?;
            info!(
                endpoint = %proxy.config().endpoint(),
                timeout_secs = proxy.config().timeout_secs,
                "Using remote endpoint"
            );
            let studio = Studio::new(&config, Device::Cpu, Box::new(PreviewPipelineFactory))?.with_remote(proxy);
            let response = studio.generate_remote(&request.into_raw());
            report(response.status, response.artifact.map(|a| a.path))?;
        }
    }
    Ok(())
}

fn select_device(cpu: bool) -> Device {
    if cpu {
        info!("Using CPU");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => {
            if device.is_cuda() {
                info!("Using CUDA device 0");
            }
            device
        }
        Err(e) => {
            warn!("CUDA not available: {}, falling back to CPU", e);
            Device::Cpu
        }
    }
}

fn print_section(title: &str, names: &[String]) {
    println!("{title}:");
    if names.is_empty() {
        println!("  (none)");
    }
    for name in names {
        println!("  {name}");
    }
}

fn report(status: String, path: Option<PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            info!("{status}: {}", path.display());
            println!("{}", path.display());
            Ok(())
        }
        None => anyhow::bail!(status),
    }
}
