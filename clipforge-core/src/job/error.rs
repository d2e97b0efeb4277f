use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::asset::StoreError;
use crate::error::ConfigError;
use crate::transform::{ArchiveError, SwapError, TransformError};

/// Failure classes exposed to whatever boundary sits in front of the
/// orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    InvalidParams,
    ProcessFailure,
    IoError,
    Conflict,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::InvalidParams => "invalid_params",
            FailureKind::ProcessFailure => "process_failure",
            FailureKind::IoError => "io_error",
            FailureKind::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("unsupported upload: {0}")]
    UnsupportedMedia(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("asset {id} has no rendition `{rung}`")]
    UnknownRung { id: String, rung: String },
    #[error("backing file for asset {id} missing at {path}")]
    MissingArtifact { id: String, path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("job task aborted: {0}")]
    Aborted(String),
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Store(StoreError::NotFound { .. }) => FailureKind::NotFound,
            JobError::Store(StoreError::Conflict { .. }) => FailureKind::Conflict,
            JobError::Store(StoreError::Io { .. }) => FailureKind::IoError,
            JobError::Store(_) => FailureKind::ProcessFailure,
            JobError::Transform(TransformError::InvalidParams(_)) => FailureKind::InvalidParams,
            JobError::Transform(TransformError::MissingInput(_)) => FailureKind::NotFound,
            JobError::Transform(_) => FailureKind::ProcessFailure,
            JobError::Swap(_) => FailureKind::IoError,
            JobError::Archive(ArchiveError::ManifestNotFound(_)) => FailureKind::NotFound,
            JobError::Archive(_) => FailureKind::IoError,
            JobError::UnsupportedMedia(_) | JobError::InvalidParams(_) => {
                FailureKind::InvalidParams
            }
            JobError::UnknownRung { .. } | JobError::MissingArtifact { .. } => {
                FailureKind::NotFound
            }
            JobError::Io { .. } => FailureKind::IoError,
            JobError::Config(_) | JobError::Aborted(_) => FailureKind::ProcessFailure,
        }
    }

    /// Message safe to hand to a remote caller. Process failures and
    /// unclassified errors collapse to a generic sentence; the detail goes
    /// to the log instead.
    pub fn public_message(&self) -> String {
        match self.kind() {
            FailureKind::ProcessFailure => "media processing failed".to_string(),
            FailureKind::IoError => "storage operation failed".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type JobResult<T> = std::result::Result<T, JobError>;
