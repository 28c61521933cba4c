//! Forwarding generation requests to a hosted inference endpoint.
//!
//! The proxy does no local validation: the request is shipped as-is with its
//! media inlined as base64, and the reply's base64 payload is written through
//! the same [`OutputMaterializer`] the local path uses.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RemoteConfig;
use crate::error::{Result, StudioError};
use crate::materialize::{Artifact, ArtifactKind, OutputMaterializer};
use crate::validator::{GenerationMethod, RawRequest};

/// Body of an inference call, field names as the endpoint expects them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub base_model_path: String,
    pub lora_model_path: String,
    pub lora_alpha_slider: f64,
    pub prompt_textbox: String,
    pub negative_prompt_textbox: String,
    pub sampler_dropdown: String,
    pub sample_step_slider: usize,
    pub resize_method: String,
    pub width_slider: usize,
    pub height_slider: usize,
    pub base_resolution: usize,
    pub generation_method: String,
    pub length_slider: usize,
    pub cfg_scale_slider: f64,
    pub start_image: Option<String>,
    pub end_image: Option<String>,
    pub validation_video: Option<String>,
    pub denoise_strength: f64,
    pub seed_textbox: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RemoteReply {
    base64_encoding: Option<String>,
    message: Option<String>,
}

fn encode_file(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|p| fs::read(p).map(|bytes| STANDARD.encode(bytes)))
        .transpose()
        .map_err(StudioError::from)
}

/// Build the request body, reading and inlining any media files
pub fn build_envelope(raw: &RawRequest) -> Result<RemoteRequest> {
    Ok(RemoteRequest {
        base_model_path: raw.base_weights.clone(),
        lora_model_path: raw.lora.clone(),
        lora_alpha_slider: raw.lora_strength,
        prompt_textbox: raw.prompt.clone(),
        negative_prompt_textbox: raw.negative_prompt.clone(),
        sampler_dropdown: raw.sampler.clone(),
        sample_step_slider: raw.num_inference_steps,
        resize_method: raw.resize_mode.label().to_string(),
        width_slider: raw.width,
        height_slider: raw.height,
        base_resolution: raw.base_resolution,
        generation_method: raw.method.label().to_string(),
        length_slider: raw.num_frames,
        cfg_scale_slider: raw.guidance_scale,
        start_image: encode_file(raw.start_image.as_deref())?,
        end_image: encode_file(raw.end_image.as_deref())?,
        validation_video: encode_file(raw.reference_video.as_deref())?,
        denoise_strength: raw.denoise_strength,
        seed_textbox: raw.seed.clone(),
    })
}

/// Extract the encoded artifact from a reply, or the endpoint's message as an error
pub fn decode_response(reply: &serde_json::Value) -> Result<Vec<u8>> {
    let reply: RemoteReply = serde_json::from_value(reply.clone()).unwrap_or_default();
    match (reply.base64_encoding, reply.message) {
        (Some(payload), _) => STANDARD
            .decode(payload.trim())
            .map_err(|e| StudioError::Remote(format!("invalid base64 payload: {e}"))),
        (None, Some(message)) => Err(StudioError::Remote(message)),
        (None, None) => Err(StudioError::Remote(
            "response carried neither a payload nor a message".into(),
        )),
    }
}

/// Output kind the endpoint produces for `raw`
pub fn expected_kind(raw: &RawRequest) -> ArtifactKind {
    if raw.method == GenerationMethod::Image || raw.num_frames == 1 {
        ArtifactKind::Image
    } else {
        ArtifactKind::Video
    }
}

pub struct RemoteProxy {
    config: RemoteConfig,
    client: reqwest::blocking::Client,
}

impl RemoteProxy {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StudioError::Remote(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// POST the envelope and return the decoded artifact bytes
    pub fn infer(&self, envelope: &RemoteRequest) -> Result<Vec<u8>> {
        let endpoint = self.config.endpoint();
        info!(%endpoint, method = %envelope.generation_method, "Forwarding request");

        let mut request = self.client.post(&endpoint).json(envelope);
        if let Some(token) = &self.config.token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }
        let response = request
            .send()
            .map_err(|e| StudioError::Remote(format!("request to {endpoint} failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| StudioError::Remote(format!("failed to read response: {e}")))?;
        let body: Option<serde_json::Value> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            warn!(%status, "Remote endpoint returned an error status");
            let detail = body
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or(text);
            return Err(StudioError::Remote(format!("{status}: {detail}")));
        }

        let body = body.ok_or_else(|| StudioError::Remote("response is not JSON".into()))?;
        decode_response(&body)
    }

    /// Forward `raw` and store the returned artifact
    pub fn generate(&self, raw: &RawRequest, materializer: &OutputMaterializer) -> Result<Artifact> {
        let envelope = build_envelope(raw)?;
        let bytes = self.infer(&envelope)?;
        materializer.write_encoded(&bytes, expected_kind(raw))
    }
}
