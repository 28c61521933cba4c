//! Error types shared by the session, validator, orchestrator and proxy.

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::loader::LoaderError;

pub type Result<T> = std::result::Result<T, StudioError>;

/// Coarse classification used by front-ends to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Nothing loaded, incompatible checkpoint for the request, bad numeric input.
    Configuration,
    /// Missing conditioning media or mutually exclusive inputs.
    Validation,
    /// Weight files missing or malformed.
    ModelLoad,
    /// The pipeline invocation itself failed.
    Generation,
    /// The hosted endpoint failed or answered with garbage.
    Remote,
    /// Local filesystem or encoding problems while persisting output.
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error("Please select a pretrained model path.")]
    NoCheckpoint,

    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    Validation(String),

    #[error("Failed to load weights from {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: LoaderError,
    },

    #[error("{0}")]
    Generation(String),

    #[error("Remote inference failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("Failed to encode video: {0}")]
    Encoding(#[from] gif::EncodingError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StudioError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn model_load(path: impl Into<PathBuf>, source: LoaderError) -> Self {
        Self::ModelLoad {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCheckpoint | Self::Configuration(_) | Self::Config(_) => {
                ErrorKind::Configuration
            }
            Self::Validation(_) => ErrorKind::Validation,
            Self::ModelLoad { .. } => ErrorKind::ModelLoad,
            Self::Generation(_) | Self::Candle(_) => ErrorKind::Generation,
            Self::Remote(_) => ErrorKind::Remote,
            Self::Io(_) | Self::Image(_) | Self::Encoding(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Whether the error was raised before anything was dispatched to the pipeline.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Validation
        )
    }
}
