use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::command::PlannedArtifact;
use super::error::SwapError;

/// Makes a produced artifact canonical and returns its final path.
///
/// Single files are renamed from their temporary sibling onto the target,
/// which replaces any previous file in one step. Segmented output already
/// lives in its own fresh directory, so only the manifest is checked.
pub async fn promote(artifact: &PlannedArtifact) -> Result<PathBuf, SwapError> {
    match artifact {
        PlannedArtifact::File { temp, target } => {
            if !is_file(temp).await {
                return Err(SwapError::MissingOutput(temp.clone()));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| SwapError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            fs::rename(temp, target)
                .await
                .map_err(|source| SwapError::Io {
                    path: target.clone(),
                    source,
                })?;
            debug!(target: "transform.swap", from = %temp.display(), to = %target.display(), "artifact promoted");
            Ok(target.clone())
        }
        PlannedArtifact::Directory { manifest, .. } => {
            if !is_file(manifest).await {
                return Err(SwapError::MissingOutput(manifest.clone()));
            }
            Ok(manifest.clone())
        }
    }
}

/// Removes whatever a failed run left behind. Never touches the target of a
/// single-file plan, which may still be the canonical artifact.
pub async fn discard(artifact: &PlannedArtifact) {
    let leftover = match artifact {
        PlannedArtifact::File { temp, .. } => temp,
        PlannedArtifact::Directory { root, .. } => root,
    };
    if let Err(err) = remove_path(leftover).await {
        warn!(target: "transform.swap", path = %leftover.display(), error = %err, "failed to clean partial output");
    }
}

/// Deletes a file or directory tree. A missing path counts as removed.
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}
