use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const DATABASE_FILE_NAME: &str = "assets.sqlite";
pub const FAILURE_LOG_NAME: &str = "job_failures.log";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ForgeConfig {
    pub paths: PathsSection,
    pub tools: ToolsSection,
    pub limits: LimitsSection,
    #[serde(default)]
    pub segmenting: SegmentingSection,
    #[serde(default)]
    pub upload: UploadSection,
}

impl ForgeConfig {
    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.storage_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.paths.data_dir).join(DATABASE_FILE_NAME)
    }

    pub fn failure_log_path(&self) -> PathBuf {
        Path::new(&self.paths.logs_dir).join(FAILURE_LOG_NAME)
    }

    /// Checks the values the pipeline cannot run without. Called once at
    /// startup so a misconfigured node fails before accepting work.
    pub fn validate(&self) -> Result<PathBuf> {
        if self.limits.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_concurrent_jobs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.segmenting.segment_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "segmenting.segment_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.upload.accepted.is_empty() {
            return Err(ConfigError::Invalid {
                field: "upload.accepted",
                reason: "at least one accepted media type is required".into(),
            });
        }
        self.tools.resolve_ffmpeg()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub storage_dir: String,
    pub data_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ffmpeg: String,
    #[serde(default = "ToolsSection::default_log_level")]
    pub log_level: String,
}

impl ToolsSection {
    fn default_log_level() -> String {
        "error".to_string()
    }

    pub fn resolve_ffmpeg(&self) -> Result<PathBuf> {
        resolve_program(&self.ffmpeg).ok_or_else(|| ConfigError::ToolNotFound {
            tool: self.ffmpeg.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_concurrent_jobs: u32,
    pub default_timeout_seconds: u64,
    pub transcode_timeout_seconds: u64,
}

impl LimitsSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentingSection {
    pub segment_seconds: u32,
    pub video_codec: String,
    pub audio_codec: String,
}

impl Default for SegmentingSection {
    fn default() -> Self {
        Self {
            segment_seconds: 10,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    pub accepted: Vec<AcceptedMedia>,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            accepted: vec![AcceptedMedia {
                content_type: "video/mp4".to_string(),
                extension: "mp4".to_string(),
            }],
        }
    }
}

impl UploadSection {
    /// Both the declared content type and the filename extension must match
    /// the same accepted entry.
    pub fn accepts(&self, content_type: &str, extension: &str) -> bool {
        self.accepted.iter().any(|media| {
            media.content_type.eq_ignore_ascii_case(content_type.trim())
                && media.extension.eq_ignore_ascii_case(extension)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptedMedia {
    pub content_type: String,
    pub extension: String,
}

pub fn load_forge_config<P: AsRef<Path>>(path: P) -> Result<ForgeConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[paths]
storage_dir = "/srv/clipforge/videos"
data_dir = "/srv/clipforge/data"
logs_dir = "/srv/clipforge/logs"

[tools]
ffmpeg = "ffmpeg"

[limits]
max_concurrent_jobs = 2
default_timeout_seconds = 600
transcode_timeout_seconds = 1800
"#;

    #[test]
    fn sections_fall_back_to_defaults() {
        let config: ForgeConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.tools.log_level, "error");
        assert_eq!(config.segmenting.segment_seconds, 10);
        assert_eq!(config.segmenting.video_codec, "libx264");
        assert!(config.upload.accepts("video/mp4", "MP4"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/srv/clipforge/data/assets.sqlite")
        );
        assert_eq!(config.limits.transcode_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn upload_requires_type_and_extension_together() {
        let upload = UploadSection::default();
        assert!(upload.accepts("video/mp4", "mp4"));
        assert!(!upload.accepts("video/mp4", "mov"));
        assert!(!upload.accepts("application/octet-stream", "mp4"));
    }

    #[test]
    fn missing_tool_fails_validation() {
        let mut config: ForgeConfig = toml::from_str(SAMPLE).unwrap();
        config.tools.ffmpeg = "/nonexistent/bin/ffmpeg-clipforge".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ToolNotFound { .. })
        ));
    }

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/clipforge.toml");
        let config = load_forge_config(path).expect("fixture config should parse");
        assert_eq!(config.limits.max_concurrent_jobs, 2);
        assert_eq!(config.upload.accepted.len(), 1);
    }
}
