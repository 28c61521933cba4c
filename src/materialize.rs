//! Persisting generated frames and the parameter log.
//!
//! Layout of one session directory:
//!
//! ```text
//! <session>/
//!   logs.json      pretty JSON records separated by a blank line
//!   sample/
//!     001.gif      video, 8 fps
//!     002.png      still image
//! ```

use candle_core::Tensor;
use gif::{Encoder, Frame, Repeat};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Result, StudioError};
use crate::media::tensor_to_frames;
use crate::validator::GenerationRequest;

pub const SAMPLE_DIR: &str = "sample";
pub const LOG_FILE: &str = "logs.json";
pub const VIDEO_FPS: u16 = 8;
/// Quantizer effort for GIF frames, 1 (best) to 30 (fastest)
const GIF_SPEED: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

/// Parameters worth auditing, one record per successful generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationLogRecord {
    pub prompt: String,
    #[serde(rename = "n_prompt")]
    pub negative_prompt: String,
    pub sampler: String,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub video_length: usize,
    #[serde(rename = "seed_textbox")]
    pub seed: u64,
}

impl From<&GenerationRequest> for GenerationLogRecord {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            sampler: request.sampler.label().to_string(),
            num_inference_steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            width: request.width,
            height: request.height,
            video_length: request.num_frames,
            seed: request.seed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputMaterializer {
    session_dir: PathBuf,
}

impl OutputMaterializer {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn sample_dir(&self) -> PathBuf {
        self.session_dir.join(SAMPLE_DIR)
    }

    pub fn log_path(&self) -> PathBuf {
        self.session_dir.join(LOG_FILE)
    }

    /// Entries already in the sample directory, plus one
    pub fn next_index(&self) -> Result<usize> {
        let dir = self.sample_dir();
        if !dir.exists() {
            return Ok(1);
        }
        Ok(fs::read_dir(dir)?.count() + 1)
    }

    fn next_path(&self, extension: &str) -> Result<PathBuf> {
        let dir = self.sample_dir();
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{:03}.{extension}", self.next_index()?)))
    }

    /// Write the frames of `request` and append its log record
    pub fn materialize(&self, request: &GenerationRequest, frames: &Tensor) -> Result<Artifact> {
        let artifact = if request.produces_still() {
            self.write_image(frames)?
        } else {
            self.write_video(frames)?
        };
        self.append_log(&GenerationLogRecord::from(request))?;
        Ok(artifact)
    }

    /// First frame as a PNG
    pub fn write_image(&self, frames: &Tensor) -> Result<Artifact> {
        let first = tensor_to_frames(&frames.narrow(2, 0, 1)?)?
            .into_iter()
            .next()
            .ok_or_else(|| StudioError::Generation("No frame to save".into()))?;
        let path = self.next_path("png")?;
        first.save(&path)?;
        info!(path = %path.display(), "Saved image");
        Ok(Artifact {
            path,
            kind: ArtifactKind::Image,
        })
    }

    /// All frames as a looping animated GIF
    pub fn write_video(&self, frames: &Tensor) -> Result<Artifact> {
        let frames = tensor_to_frames(frames)?;
        let Some(first) = frames.first() else {
            return Err(StudioError::Generation("No frames to save".into()));
        };
        let (w, h) = first.dimensions();
        let (w, h) = (
            u16::try_from(w).map_err(|_| StudioError::Generation(format!("Frame width {w} too large for GIF")))?,
            u16::try_from(h).map_err(|_| StudioError::Generation(format!("Frame height {h} too large for GIF")))?,
        );

        let path = self.next_path("gif")?;
        let file = BufWriter::new(File::create(&path)?);
        let mut encoder = Encoder::new(file, w, h, &[])?;
        encoder.set_repeat(Repeat::Infinite)?;
        // Delay is in hundredths of a second
        let delay = 100 / VIDEO_FPS;
        for image in &frames {
            let mut frame = Frame::from_rgb_speed(w, h, image.as_raw(), GIF_SPEED);
            frame.delay = delay;
            encoder.write_frame(&frame)?;
        }
        drop(encoder);

        info!(path = %path.display(), frames = frames.len(), fps = VIDEO_FPS, "Saved video");
        Ok(Artifact {
            path,
            kind: ArtifactKind::Video,
        })
    }

    /// Append one record: pretty JSON followed by a blank line
    pub fn append_log(&self, record: &GenerationLogRecord) -> Result<()> {
        fs::create_dir_all(&self.session_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        let json = serde_json::to_string_pretty(record)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n\n")?;
        Ok(())
    }

    /// Store an already-encoded payload under the next sequence number
    pub fn write_encoded(&self, bytes: &[u8], kind: ArtifactKind) -> Result<Artifact> {
        let extension = match kind {
            ArtifactKind::Image => "png",
            ArtifactKind::Video => sniff_video_extension(bytes),
        };
        let path = self.next_path(extension)?;
        fs::write(&path, bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), "Saved remote result");
        Ok(Artifact { path, kind })
    }
}

fn sniff_video_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"GIF8") {
        "gif"
    } else if bytes.len() > 8 && &bytes[4..8] == b"ftyp" {
        "mp4"
    } else if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        "webm"
    } else {
        "gif"
    }
}
