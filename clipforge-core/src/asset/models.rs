use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

pub const MANIFEST_EXTENSION: &str = "m3u8";
pub const SEGMENTED_FORMAT: &str = "m3u8";

/// Persisted record for one uploaded media file and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub id: String,
    pub logical_name: String,
    pub format: String,
    pub storage_path: PathBuf,
    pub processing: bool,
    pub processing_success: Option<bool>,
    pub last_operation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(
        id: impl Into<String>,
        logical_name: impl Into<String>,
        format: impl Into<String>,
        storage_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            logical_name: logical_name.into(),
            format: format.into(),
            storage_path: storage_path.into(),
            processing: false,
            processing_success: None,
            last_operation: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            logical_name: row.get("logical_name")?,
            format: row.get("format")?,
            storage_path: PathBuf::from(row.get::<_, String>("storage_path")?),
            processing: row.get("processing")?,
            processing_success: row.get("processing_success")?,
            last_operation: row.get("last_operation")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn state(&self) -> AssetState {
        match (self.processing, self.processing_success) {
            (true, _) => AssetState::Processing,
            (false, None) => AssetState::Idle,
            (false, Some(true)) => AssetState::Succeeded,
            (false, Some(false)) => AssetState::Failed,
        }
    }

    /// True when the canonical artifact is a segmented manifest rather than
    /// a single media file.
    pub fn is_segmented(&self) -> bool {
        is_manifest(&self.storage_path)
    }

    /// Filesystem entry that owns the artifact: the file itself, or the
    /// directory holding the manifest and its segments.
    pub fn artifact_root(&self) -> &Path {
        artifact_root(&self.storage_path)
    }

    pub fn download_name(&self) -> String {
        format!("{}.{}", self.logical_name, self.format)
    }

    pub fn view(&self) -> AssetView {
        AssetView::from(self)
    }
}

pub(crate) fn is_manifest(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION))
        .unwrap_or(false)
}

pub(crate) fn artifact_root(path: &Path) -> &Path {
    if is_manifest(path) {
        path.parent().unwrap_or(path)
    } else {
        path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Idle,
    Processing,
    Succeeded,
    Failed,
}

impl AssetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::Idle => "idle",
            AssetState::Processing => "processing",
            AssetState::Succeeded => "succeeded",
            AssetState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AssetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public read shape handed to the boundary layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub id: String,
    pub filename: String,
    pub format: String,
    pub processing: bool,
    pub processing_success: Option<bool>,
}

impl From<&Asset> for AssetView {
    fn from(asset: &Asset) -> Self {
        Self {
            id: asset.id.clone(),
            filename: asset.logical_name.clone(),
            format: asset.format.clone(),
            processing: asset.processing,
            processing_success: asset.processing_success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_follows_flags() {
        let mut asset = Asset::new("a1", "clip", "mp4", "/videos/a1.mp4");
        assert_eq!(asset.state(), AssetState::Idle);
        asset.processing = true;
        assert_eq!(asset.state(), AssetState::Processing);
        asset.processing = false;
        asset.processing_success = Some(false);
        assert_eq!(asset.state(), AssetState::Failed);
    }

    #[test]
    fn segmented_assets_own_their_directory() {
        let asset = Asset::new("a1", "clip", "m3u8", "/videos/a1_hls_x/index.m3u8");
        assert!(asset.is_segmented());
        assert_eq!(asset.artifact_root(), Path::new("/videos/a1_hls_x"));

        let file = Asset::new("a2", "clip", "mp4", "/videos/a2.mp4");
        assert!(!file.is_segmented());
        assert_eq!(file.artifact_root(), Path::new("/videos/a2.mp4"));
        assert_eq!(file.download_name(), "clip.mp4");
    }

    #[test]
    fn view_uses_camel_case_keys() {
        let asset = Asset::new("a1", "clip", "mp4", "/videos/a1.mp4");
        let json = serde_json::to_value(asset.view()).unwrap();
        assert_eq!(json["filename"], "clip");
        assert!(json["processingSuccess"].is_null());
        assert_eq!(json["processing"], false);
    }
}
