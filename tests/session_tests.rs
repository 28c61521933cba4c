//! Model session tests: checkpoint loading, base-weight overlays and LoRA
//! merge/unmerge against checkpoints written to a temp directory.

mod common;

use candle_core::{DType, Device, Tensor};
use candle_cogvideo::checkpoint::{CheckpointModality, OffloadPolicy, PipelineVariant};
use candle_cogvideo::error::ErrorKind;
use candle_cogvideo::orchestrator::{GenerationPhase, Orchestrator};
use candle_cogvideo::validator::{RawRequest, RequestValidator};
use candle_cogvideo::{ModelSession, StudioError};
use common::*;
use tempfile::tempdir;

fn session_with(base: &std::path::Path, recorder: &Recorder) -> ModelSession {
    ModelSession::new(&studio_config(base), Device::Cpu, recorder.factory())
}

fn checkpoint_dir(base: &std::path::Path) -> std::path::PathBuf {
    base.join("models/Diffusion_Transformer")
}

// =============================================================================
// Checkpoint loading
// =============================================================================

#[test]
fn test_load_checkpoint_by_name() {
    let base = tempdir().unwrap();
    write_checkpoint(&checkpoint_dir(base.path()), "CogVideoX-Fun-2b-InP", INPAINT_CHANNELS);
    let recorder = Recorder::default();
    let mut session = session_with(base.path(), &recorder);

    assert_eq!(session.registry().list_checkpoints(), vec!["CogVideoX-Fun-2b-InP"]);
    session.load_checkpoint("CogVideoX-Fun-2b-InP").unwrap();

    let handle = session.checkpoint().unwrap();
    assert_eq!(handle.name, "CogVideoX-Fun-2b-InP");
    assert_eq!(handle.modality, CheckpointModality::ImageVideoCapable);
    assert_eq!(handle.variant(), PipelineVariant::Inpaint);
    assert_eq!(handle.temporal_compression_ratio, 4);
    assert_eq!(handle.spatial_compression_ratio, 8);
    assert_eq!(*recorder.builds.lock().unwrap(), 1);

    // The "transformer." prefix is stripped on load
    let params = session.transformer().unwrap();
    assert_eq!(params.len(), 3);
    assert!(params.contains(Q_PROJ));
    assert_eq!(session.offload_policy(), OffloadPolicy::ModelLevel);
}

#[test]
fn test_text_only_checkpoint_modality() {
    let base = tempdir().unwrap();
    let path = write_checkpoint(base.path(), "CogVideoX-Fun-2b", TEXT_ONLY_CHANNELS);
    let recorder = Recorder::default();
    let mut session = session_with(base.path(), &recorder);

    // An existing path is accepted as-is
    session.load_checkpoint(path.to_str().unwrap()).unwrap();
    let handle = session.checkpoint().unwrap();
    assert_eq!(handle.modality, CheckpointModality::TextToVideoOnly);
    assert_eq!(handle.variant(), PipelineVariant::Plain);
}

#[test]
fn test_failed_load_keeps_previous_checkpoint() {
    let base = tempdir().unwrap();
    let ckpts = checkpoint_dir(base.path());
    write_checkpoint(&ckpts, "good", INPAINT_CHANNELS);
    let broken = write_checkpoint(&ckpts, "broken", INPAINT_CHANNELS);
    std::fs::remove_file(broken.join("vae/diffusion_pytorch_model.safetensors")).unwrap();

    let recorder = Recorder::default();
    let mut session = session_with(base.path(), &recorder);
    session.load_checkpoint("good").unwrap();
    let before = q_values(&session);

    let err = session.load_checkpoint("broken").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert!(err.to_string().contains("broken"));
    assert_eq!(session.checkpoint().unwrap().name, "good");
    assert_eq!(q_values(&session), before);
}

#[test]
fn test_fixed_model_session_generates() {
    let base = tempdir().unwrap();
    write_checkpoint(&checkpoint_dir(base.path()), "CogVideoX-Fun-2b-InP", INPAINT_CHANNELS);
    let recorder = Recorder::default();
    let mut session = ModelSession::with_checkpoint(
        &studio_config(base.path()),
        Device::Cpu,
        recorder.factory(),
        "CogVideoX-Fun-2b-InP",
    )
    .unwrap();

    let handle = session.checkpoint().unwrap();
    assert_eq!(handle.name, "CogVideoX-Fun-2b-InP");
    assert_eq!(handle.modality, CheckpointModality::ImageVideoCapable);
    assert_eq!(*recorder.builds.lock().unwrap(), 1);

    let mut raw = RawRequest::new("a red ball bouncing");
    raw.width = 32;
    raw.height = 16;
    raw.num_frames = 9;
    let request = RequestValidator::new().validate(&raw, session.checkpoint()).unwrap();
    let video = Orchestrator::default().run(&mut session, &request).unwrap();
    assert_eq!(video.pipeline_calls, 1);
    assert_eq!(recorder.calls()[0].num_frames, 9);
}

#[test]
fn test_fixed_model_session_needs_a_checkpoint() {
    let base = tempdir().unwrap();
    let config = studio_config(base.path());

    let err = ModelSession::with_checkpoint(&config, Device::Cpu, Recorder::default().factory(), "none")
        .err()
        .unwrap();
    assert!(matches!(err, StudioError::NoCheckpoint));

    let err = ModelSession::with_checkpoint(&config, Device::Cpu, Recorder::default().factory(), "missing")
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
}

#[test]
fn test_low_memory_mode_selects_sequential_offload() {
    let base = tempdir().unwrap();
    let config = studio_config(base.path()).with_low_gpu_memory_mode(true);
    let session = ModelSession::new(&config, Device::Cpu, Recorder::default().factory());
    assert_eq!(session.offload_policy(), OffloadPolicy::Sequential);
}

// =============================================================================
// Base weights
// =============================================================================

#[test]
fn test_base_weights_overlay() {
    let base = tempdir().unwrap();
    write_checkpoint(&checkpoint_dir(base.path()), "ckpt", INPAINT_CHANNELS);
    let personalized = base.path().join("models/Personalized_Model");
    std::fs::create_dir_all(&personalized).unwrap();
    save_tensors(
        &personalized.join("realistic.safetensors"),
        &[
            (Q_PROJ, Tensor::full(3f32, (4, 4), &Device::Cpu).unwrap()),
            ("text_proj.weight", Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap()),
        ],
    );

    let recorder = Recorder::default();
    let mut session = session_with(base.path(), &recorder);
    session.load_checkpoint("ckpt").unwrap();
    assert_eq!(session.registry().list_base_weights(), vec!["realistic.safetensors"]);

    let report = session.apply_base_weights("realistic.safetensors").unwrap().unwrap();
    assert_eq!(report.applied, vec![Q_PROJ.to_string()]);
    assert_eq!(report.unknown, vec!["text_proj.weight".to_string()]);
    assert_eq!(report.untouched, 2);
    assert!(q_values(&session).iter().all(|&v| v == 3.0));
    assert_eq!(session.adapters().base_weights.as_deref(), Some("realistic.safetensors"));

    // Reloading the checkpoint brings back its own weights and clears the record
    session.load_checkpoint("ckpt").unwrap();
    assert_eq!(q_values(&session)[1], 1.0);
    assert!(session.adapters().base_weights.is_none());
}

#[test]
fn test_base_weights_shape_mismatch_leaves_transformer() {
    let base = tempdir().unwrap();
    write_checkpoint(&checkpoint_dir(base.path()), "ckpt", INPAINT_CHANNELS);
    let personalized = base.path().join("models/Personalized_Model");
    std::fs::create_dir_all(&personalized).unwrap();
    save_tensors(
        &personalized.join("wrong.safetensors"),
        &[
            (K_PROJ, Tensor::full(9f32, (4, 4), &Device::Cpu).unwrap()),
            (Q_PROJ, Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap()),
        ],
    );

    let mut session = session_with(base.path(), &Recorder::default());
    session.load_checkpoint("ckpt").unwrap();
    let before = q_values(&session);

    let err = session.apply_base_weights("wrong.safetensors").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert_eq!(q_values(&session), before);
    let k = session.transformer().unwrap().get(K_PROJ).unwrap();
    assert_eq!(k.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0], 1.0);
    assert!(session.adapters().base_weights.is_none());
}

// =============================================================================
// LoRA merge / unmerge
// =============================================================================

fn lora_session(base: &std::path::Path, recorder: &Recorder) -> ModelSession {
    write_checkpoint(&checkpoint_dir(base), "ckpt", INPAINT_CHANNELS);
    write_lora(&base.join("models/Personalized_Model/style.safetensors"));
    let mut session = session_with(base, recorder);
    session.load_checkpoint("ckpt").unwrap();
    session
}

#[test]
fn test_lora_is_merged_only_during_generation() {
    let base = tempdir().unwrap();
    let recorder = Recorder::default();
    let mut session = lora_session(base.path(), &recorder);
    let original = q_values(&session);

    let mut raw = RawRequest::new("a red ball bouncing");
    raw.width = 32;
    raw.height = 16;
    raw.num_frames = 9;
    raw.lora = "style.safetensors".into();
    raw.lora_strength = 0.5;
    session.sync_adapters(&raw.base_weights, &raw.lora, raw.lora_strength).unwrap();
    // Staging alone does not touch the weights
    assert_eq!(q_values(&session), original);

    let request = RequestValidator::new().validate(&raw, session.checkpoint()).unwrap();
    let mut orchestrator = Orchestrator::default();
    let video = orchestrator.run(&mut session, &request).unwrap();
    assert_eq!(video.pipeline_calls, 1);

    let calls = recorder.calls();
    let expected: Vec<f32> = original.iter().map(|v| v + 0.5).collect();
    assert_eq!(calls[0].q_weight, expected);
    assert_eq!(q_values(&session), original);
    assert_eq!(orchestrator.phase(), GenerationPhase::WeightsRestoring);
}

#[test]
fn test_lora_is_unmerged_after_pipeline_failure() {
    let base = tempdir().unwrap();
    let recorder = Recorder::default();
    let mut session = lora_session(base.path(), &recorder);
    let original = q_values(&session);

    let mut raw = RawRequest::new("x");
    raw.width = 32;
    raw.height = 16;
    raw.num_frames = 5;
    raw.lora = "style.safetensors".into();
    session.sync_adapters(&raw.base_weights, &raw.lora, raw.lora_strength).unwrap();
    let request = RequestValidator::new().validate(&raw, session.checkpoint()).unwrap();

    recorder.set_failing(true);
    let mut orchestrator = Orchestrator::default();
    let err = orchestrator.run(&mut session, &request).unwrap_err();
    assert!(matches!(err, StudioError::Generation(_)));
    assert!(err.to_string().contains("out of memory"));
    assert_eq!(orchestrator.phase(), GenerationPhase::Failed);

    // The pipeline saw merged weights, the session holds the originals again
    assert_ne!(recorder.calls()[0].q_weight, original);
    assert_eq!(q_values(&session), original);

    // And a second attempt starts from the same state
    recorder.set_failing(false);
    orchestrator.run(&mut session, &request).unwrap();
    assert_eq!(recorder.calls()[1].q_weight, recorder.calls()[0].q_weight);
    assert_eq!(q_values(&session), original);
}

#[test]
fn test_missing_lora_archive_fails_before_sampling() {
    let base = tempdir().unwrap();
    let recorder = Recorder::default();
    let mut session = lora_session(base.path(), &recorder);
    let original = q_values(&session);

    session.stage_lora("missing.safetensors", 0.55);
    let mut raw = RawRequest::new("x");
    raw.width = 32;
    raw.height = 16;
    let request = RequestValidator::new().validate(&raw, session.checkpoint()).unwrap();

    let err = Orchestrator::default().run(&mut session, &request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert!(recorder.calls().is_empty());
    assert_eq!(q_values(&session), original);
}
