use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("input artifact missing at {0}")]
    MissingInput(PathBuf),
    #[error("{program} exited with status {status:?}")]
    Exit {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{program} terminated by signal {signal:?}")]
    Signal {
        program: String,
        signal: Option<i32>,
        stderr: String,
    },
    #[error("{program} timed out after {limit:?}")]
    Timeout { program: String, limit: Duration },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl TransformError {
    /// Captured stderr of the failed process, when there is one.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            TransformError::Exit { stderr, .. } | TransformError::Signal { stderr, .. } => {
                Some(stderr.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("produced output missing at {0}")]
    MissingOutput(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("manifest not found at {0}")]
    ManifestNotFound(PathBuf),
    #[error("manifest references an unsafe path: {0}")]
    InvalidReference(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("archive encoding failed: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub type TransformResult<T> = Result<T, TransformError>;
