use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by semiscore-core.
///
/// Every variant except `Io` and `Other` is a model-load failure: the model
/// being loaded is unusable and there is no degraded fallback. Per-frame
/// scoring never returns an error.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("model file not found: {path}")]
    ModelNotFound { path: PathBuf },

    #[error("malformed model file {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("{what} mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("truncated model file {path}: {reason}")]
    Truncated { path: PathBuf, reason: String },

    #[error("checksum mismatch in {path}: file says {expected:#010x}, computed {found:#010x}")]
    Checksum {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("more data than expected in {path}")]
    TrailingData { path: PathBuf },

    #[error("inconsistent RLE in {path}: stream {stream} codeword {codeword} expands to {found} senones, expected {expected}")]
    RleInconsistent {
        path: PathBuf,
        stream: usize,
        codeword: usize,
        expected: usize,
        found: usize,
    },

    #[error("log base {base} is too small to represent the add table in 8 bits")]
    LogTableTooWide { base: f64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScoreError {
    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ScoreError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn truncated(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ScoreError::Truncated {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScoreError>;
