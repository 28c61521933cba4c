//! Safetensors loading for checkpoints, base-weight archives and LoRA files.
//!
//! Supports:
//!
//! - Single archives (`*.safetensors`)
//! - Sharded component directories described by a `*.safetensors.index.json`
//! - JSON component configs (`config.json`, `scheduler_config.json`)
//! - Ordered tensor-name rewriting (exact, prefix, suffix)
//! - Header-only inspection to reject malformed archives early

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while locating or reading weight files
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required file: {path}")]
    MissingFile { path: String },

    #[error("Missing shard files: {missing:?}")]
    MissingShards { missing: Vec<String> },

    #[error("No safetensors files found in directory: {path}")]
    NoSafetensorsFound { path: String },

    #[error("Invalid safetensors file: {path}")]
    InvalidSafetensors {
        path: String,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("Tensor {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

// =============================================================================
// Name Mapping
// =============================================================================

#[derive(Debug, Clone)]
enum MappingRule {
    Exact { from: String, to: String },
    Prefix { from_prefix: String, to_prefix: String },
    Suffix { from_suffix: String, to_suffix: String },
}

impl MappingRule {
    fn apply(&self, name: &str) -> Option<String> {
        match self {
            MappingRule::Exact { from, to } => (name == from).then(|| to.clone()),
            MappingRule::Prefix {
                from_prefix,
                to_prefix,
            } => name
                .strip_prefix(from_prefix.as_str())
                .map(|rest| format!("{to_prefix}{rest}")),
            MappingRule::Suffix {
                from_suffix,
                to_suffix,
            } => name
                .strip_suffix(from_suffix.as_str())
                .map(|base| format!("{base}{to_suffix}")),
        }
    }
}

// =============================================================================
// Shard index
// =============================================================================

/// Parsed `*.safetensors.index.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetensorsIndex {
    /// Tensor name to shard file name
    pub weight_map: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SafetensorsIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        load_model_config(path)
    }

    /// Unique shard files, sorted
    pub fn shard_files(&self) -> Vec<String> {
        let files: HashSet<_> = self.weight_map.values().collect();
        let mut result: Vec<_> = files.into_iter().cloned().collect();
        result.sort();
        result
    }

    pub fn is_sharded(&self) -> bool {
        self.shard_files().len() > 1
    }
}

/// Index file names probed in a component directory, diffusers layout first
const INDEX_FILES: [&str; 2] = [
    "diffusion_pytorch_model.safetensors.index.json",
    "model.safetensors.index.json",
];

/// Single-file names probed in a component directory
const SINGLE_FILES: [&str; 2] = ["diffusion_pytorch_model.safetensors", "model.safetensors"];

// =============================================================================
// Weight Loader
// =============================================================================

/// Loads named tensors onto a device, converting to one dtype and rewriting names
#[derive(Debug, Clone)]
pub struct WeightLoader {
    device: Device,
    dtype: DType,
    mapping_rules: Vec<MappingRule>,
}

impl WeightLoader {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype,
            mapping_rules: Vec::new(),
        }
    }

    pub fn add_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.mapping_rules.push(MappingRule::Exact {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Replace `from_prefix` with `to_prefix` (which may be empty)
    ///
    /// # Example
    /// ```
    /// use candle_core::{Device, DType};
    /// use candle_cogvideo::loader::WeightLoader;
    ///
    /// let loader = WeightLoader::new(Device::Cpu, DType::F32)
    ///     .add_prefix_mapping("transformer.", "");
    /// assert_eq!(loader.map_name("transformer.proj_out.weight"), "proj_out.weight");
    /// ```
    pub fn add_prefix_mapping(
        mut self,
        from_prefix: impl Into<String>,
        to_prefix: impl Into<String>,
    ) -> Self {
        self.mapping_rules.push(MappingRule::Prefix {
            from_prefix: from_prefix.into(),
            to_prefix: to_prefix.into(),
        });
        self
    }

    pub fn add_suffix_mapping(
        mut self,
        from_suffix: impl Into<String>,
        to_suffix: impl Into<String>,
    ) -> Self {
        self.mapping_rules.push(MappingRule::Suffix {
            from_suffix: from_suffix.into(),
            to_suffix: to_suffix.into(),
        });
        self
    }

    /// Apply all rules in order; each rule sees the output of the previous one
    pub fn map_name(&self, name: &str) -> String {
        let mut current = name.to_string();
        for rule in &self.mapping_rules {
            if let Some(mapped) = rule.apply(&current) {
                current = mapped;
            }
        }
        current
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Read every tensor of one archive, mapped and converted
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<HashMap<String, Tensor>, LoaderError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(LoaderError::MissingFile {
                path: path.display().to_string(),
            });
        }
        // Header check first so a truncated download surfaces as InvalidSafetensors
        list_tensor_names(path)?;

        let raw = candle_core::safetensors::load(path, &self.device)?;
        let mut tensors = HashMap::with_capacity(raw.len());
        for (name, tensor) in raw {
            let tensor = if tensor.dtype() == self.dtype {
                tensor
            } else {
                tensor.to_dtype(self.dtype)?
            };
            tensors.insert(self.map_name(&name), tensor);
        }
        Ok(tensors)
    }

    pub fn load_files(&self, paths: &[PathBuf]) -> Result<HashMap<String, Tensor>, LoaderError> {
        let mut tensors = HashMap::new();
        for path in paths {
            tensors.extend(self.load_file(path)?);
        }
        Ok(tensors)
    }

    /// Load a component directory:
    /// 1. a shard index if present (all shards must exist)
    /// 2. a conventional single file
    /// 3. any `*.safetensors` in the directory
    pub fn load_directory(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<HashMap<String, Tensor>, LoaderError> {
        let files = resolve_component_files(dir)?;
        self.load_files(&files)
    }
}

/// Files that make up one component directory, in load order
pub fn resolve_component_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, LoaderError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(LoaderError::MissingFile {
            path: dir.display().to_string(),
        });
    }

    for index_name in INDEX_FILES {
        let index_path = dir.join(index_name);
        if !index_path.exists() {
            continue;
        }
        let index = SafetensorsIndex::load(&index_path)?;
        let mut missing = Vec::new();
        let mut paths = Vec::new();
        for shard in index.shard_files() {
            let shard_path = dir.join(&shard);
            if shard_path.exists() {
                paths.push(shard_path);
            } else {
                missing.push(shard);
            }
        }
        if !missing.is_empty() {
            return Err(LoaderError::MissingShards { missing });
        }
        return Ok(paths);
    }

    for single in SINGLE_FILES {
        let path = dir.join(single);
        if path.exists() {
            return Ok(vec![path]);
        }
    }

    let files = find_safetensors_files(dir, "").map_err(|source| LoaderError::FileRead {
        path: dir.display().to_string(),
        source,
    })?;
    if files.is_empty() {
        return Err(LoaderError::NoSafetensorsFound {
            path: dir.display().to_string(),
        });
    }
    Ok(files)
}

// =============================================================================
// Utility Functions
// =============================================================================

/// `*.safetensors` files in `dir` whose name starts with `prefix`, sorted
pub fn find_safetensors_files(dir: impl AsRef<Path>, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with(prefix)
            && name.ends_with(".safetensors")
            && path.is_file()
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read and deserialize a JSON config file
pub fn load_model_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LoaderError::MissingFile {
                path: path.display().to_string(),
            }
        } else {
            LoaderError::FileRead {
                path: path.display().to_string(),
                source: e,
            }
        }
    })?;

    serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })
}

/// Tensor names in an archive, read from the header only
pub fn list_tensor_names(path: impl AsRef<Path>) -> Result<Vec<String>, LoaderError> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
        LoaderError::InvalidSafetensors {
            path: path.display().to_string(),
            source: e,
        }
    })?;

    let mut names: Vec<String> = tensors.names().into_iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_mapping_chain() {
        let loader = WeightLoader::new(Device::Cpu, DType::F32)
            .add_prefix_mapping("model.", "")
            .add_suffix_mapping(".gamma", ".weight");

        assert_eq!(
            loader.map_name("model.norm_final.gamma"),
            "norm_final.weight"
        );
        assert_eq!(loader.map_name("other.bias"), "other.bias");
    }

    #[test]
    fn test_exact_mapping() {
        let loader = WeightLoader::new(Device::Cpu, DType::F32).add_mapping("pos_embed", "patch_embed.pos");
        assert_eq!(loader.map_name("pos_embed"), "patch_embed.pos");
        assert_eq!(loader.map_name("pos_embed.x"), "pos_embed.x");
    }

    #[test]
    fn test_index_shard_files() {
        let mut weight_map = HashMap::new();
        weight_map.insert("a".to_string(), "part-2.safetensors".to_string());
        weight_map.insert("b".to_string(), "part-1.safetensors".to_string());
        weight_map.insert("c".to_string(), "part-2.safetensors".to_string());
        let index = SafetensorsIndex {
            weight_map,
            metadata: None,
        };

        assert_eq!(
            index.shard_files(),
            vec!["part-1.safetensors".to_string(), "part-2.safetensors".to_string()]
        );
        assert!(index.is_sharded());
    }
}
