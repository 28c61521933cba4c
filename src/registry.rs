//! Discovery of checkpoints and personalised weight archives on disk.
//!
//! Every listing is a fresh scan; callers re-invoke to refresh. A missing or
//! empty directory is a valid empty state, not an error.

use std::path::{Path, PathBuf};

use crate::config::StudioConfig;

/// Sentinel used by selectors to mean "nothing selected"
pub const NONE_SELECTION: &str = "none";

pub fn is_none_selection(name: &str) -> bool {
    name.is_empty() || name == NONE_SELECTION
}

#[derive(Debug, Clone)]
pub struct AssetRegistry {
    checkpoint_dir: PathBuf,
    base_weights_dir: PathBuf,
    lora_dir: PathBuf,
    motion_module_dir: PathBuf,
}

impl AssetRegistry {
    pub fn new(config: &StudioConfig) -> Self {
        Self {
            checkpoint_dir: config.checkpoint_dir.clone(),
            base_weights_dir: config.personalized_dir.clone(),
            lora_dir: config.personalized_dir.clone(),
            motion_module_dir: config.motion_module_dir.clone(),
        }
    }

    pub fn list_checkpoints(&self) -> Vec<String> {
        scan(&self.checkpoint_dir, |path| path.is_dir())
    }

    pub fn list_base_weights(&self) -> Vec<String> {
        scan(&self.base_weights_dir, is_safetensors)
    }

    pub fn list_lora_weights(&self) -> Vec<String> {
        scan(&self.lora_dir, is_safetensors)
    }

    pub fn list_motion_modules(&self) -> Vec<String> {
        scan(&self.motion_module_dir, is_safetensors)
    }

    /// Resolve a checkpoint selection; an existing path is taken as-is
    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        resolve(&self.checkpoint_dir, name)
    }

    pub fn base_weights_path(&self, name: &str) -> PathBuf {
        resolve(&self.base_weights_dir, name)
    }

    pub fn lora_path(&self, name: &str) -> PathBuf {
        resolve(&self.lora_dir, name)
    }
}

fn is_safetensors(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "safetensors")
}

fn resolve(dir: &Path, name: &str) -> PathBuf {
    let candidate = Path::new(name);
    if candidate.is_absolute() || candidate.exists() {
        candidate.to_path_buf()
    } else {
        dir.join(name)
    }
}

fn scan(dir: &Path, keep: impl Fn(&Path) -> bool) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| keep(path))
        .filter_map(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
        })
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}
