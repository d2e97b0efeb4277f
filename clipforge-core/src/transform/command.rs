use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asset::models::{is_manifest, SEGMENTED_FORMAT};
use crate::config::ForgeConfig;

use super::error::{TransformError, TransformResult};

pub const MIN_DIMENSION: u32 = 20;
pub const MAX_DIMENSION: u32 = 3000;
pub const MANIFEST_NAME: &str = "index.m3u8";
pub const MASTER_MANIFEST_NAME: &str = "master.m3u8";
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";

const DEFAULT_CONTAINER: &str = "mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rung {
    pub name: &'static str,
    pub bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
}

impl Rung {
    pub fn bitrate_arg(&self) -> String {
        format!("{}k", self.bitrate_kbps)
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

pub const BITRATE_LADDER: [Rung; 5] = [
    Rung { name: "800k", bitrate_kbps: 800, width: 640, height: 360 },
    Rung { name: "1200k", bitrate_kbps: 1200, width: 842, height: 480 },
    Rung { name: "2400k", bitrate_kbps: 2400, width: 1280, height: 720 },
    Rung { name: "4800k", bitrate_kbps: 4800, width: 1920, height: 1080 },
    Rung { name: "7200k", bitrate_kbps: 7200, width: 2560, height: 1440 },
];

pub fn find_rung(name: &str) -> Option<&'static Rung> {
    BITRATE_LADDER
        .iter()
        .find(|rung| rung.name.eq_ignore_ascii_case(name.trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Xvid,
}

impl VideoCodec {
    pub fn encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Xvid => "libxvid",
        }
    }
}

impl FromStr for VideoCodec {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "h264" | "libx264" => Ok(VideoCodec::H264),
            "h265" | "hevc" | "libx265" => Ok(VideoCodec::H265),
            "vp9" | "libvpx-vp9" => Ok(VideoCodec::Vp9),
            "xvid" | "libxvid" => Ok(VideoCodec::Xvid),
            other => Err(TransformError::InvalidParams(format!(
                "unsupported codec `{other}`; expected one of h264, h265, vp9, xvid"
            ))),
        }
    }
}

/// Operation requested against one asset. Parameters arrive already parsed
/// from the boundary but are not yet range-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TransformRequest {
    Resize { width: u32, height: u32 },
    ToGif,
    CutByTime { start: String, end: String },
    TranscodeCodec { codec: String },
    ToSegmented,
    ToSegmentedMultiBitrate,
}

impl TransformRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            TransformRequest::Resize { .. } => OperationKind::Resize,
            TransformRequest::ToGif => OperationKind::ToGif,
            TransformRequest::CutByTime { .. } => OperationKind::CutByTime,
            TransformRequest::TranscodeCodec { .. } => OperationKind::TranscodeCodec,
            TransformRequest::ToSegmented => OperationKind::ToSegmented,
            TransformRequest::ToSegmentedMultiBitrate => OperationKind::ToSegmentedMultiBitrate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Resize,
    ToGif,
    CutByTime,
    TranscodeCodec,
    ToSegmented,
    ToSegmentedMultiBitrate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Resize => "resize",
            OperationKind::ToGif => "to_gif",
            OperationKind::CutByTime => "cut_by_time",
            OperationKind::TranscodeCodec => "transcode_codec",
            OperationKind::ToSegmented => "to_segmented",
            OperationKind::ToSegmentedMultiBitrate => "to_segmented_multi_bitrate",
        }
    }

    fn temp_suffix(&self) -> &'static str {
        match self {
            OperationKind::Resize => "temp",
            OperationKind::ToGif => "gif_temp",
            OperationKind::CutByTime => "cut",
            OperationKind::TranscodeCodec => "codec_temp",
            OperationKind::ToSegmented | OperationKind::ToSegmentedMultiBitrate => "hls",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully specified external process call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub outputs: Vec<PathBuf>,
}

impl Invocation {
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedArtifact {
    /// Written to `temp`, renamed onto `target` once the process succeeds.
    File { temp: PathBuf, target: PathBuf },
    /// Generated into a fresh directory; `manifest` becomes the canonical path.
    Directory { root: PathBuf, manifest: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPlaylist {
    pub path: PathBuf,
    pub contents: String,
}

#[derive(Debug, Clone)]
pub struct JobPlan {
    pub kind: OperationKind,
    pub invocations: Vec<Invocation>,
    pub artifact: PlannedArtifact,
    pub master: Option<MasterPlaylist>,
    pub format: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg: PathBuf,
    log_level: String,
    storage_dir: PathBuf,
    segment_seconds: u32,
    video_codec: String,
    audio_codec: String,
    default_timeout: Duration,
    transcode_timeout: Duration,
}

impl CommandBuilder {
    pub fn new(config: &ForgeConfig, ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            log_level: config.tools.log_level.clone(),
            storage_dir: config.storage_dir(),
            segment_seconds: config.segmenting.segment_seconds,
            video_codec: config.segmenting.video_codec.clone(),
            audio_codec: config.segmenting.audio_codec.clone(),
            default_timeout: config.limits.default_timeout(),
            transcode_timeout: config.limits.transcode_timeout(),
        }
    }

    /// Translates a request into the invocations that realise it. Performs
    /// no writes; only checks that `input` exists.
    pub fn build(
        &self,
        request: &TransformRequest,
        asset_id: &str,
        input: &Path,
    ) -> TransformResult<JobPlan> {
        validate_request(request)?;
        if !input.is_file() {
            return Err(TransformError::MissingInput(input.to_path_buf()));
        }
        let kind = request.kind();
        match request {
            TransformRequest::Resize { width, height } => {
                let container = container_of(input);
                let (temp, target) = self.file_paths(asset_id, kind, &container);
                let args = self.file_args(
                    input,
                    &["-vf".to_string(), format!("scale={width}:{height}")],
                    &temp,
                );
                Ok(self.file_plan(kind, args, temp, target, container))
            }
            TransformRequest::ToGif => {
                let (temp, target) = self.file_paths(asset_id, kind, "gif");
                let args = self.file_args(
                    input,
                    &["-an".to_string(), "-f".to_string(), "gif".to_string()],
                    &temp,
                );
                Ok(self.file_plan(kind, args, temp, target, "gif".to_string()))
            }
            TransformRequest::CutByTime { start, end } => {
                let (start_ms, end_ms) = parse_cut_range(start, end)?;
                let container = container_of(input);
                let (temp, target) = self.file_paths(asset_id, kind, &container);
                let args = self.file_args(
                    input,
                    &[
                        "-ss".to_string(),
                        format_seconds(start_ms),
                        "-t".to_string(),
                        format_seconds(end_ms - start_ms),
                    ],
                    &temp,
                );
                Ok(self.file_plan(kind, args, temp, target, container))
            }
            TransformRequest::TranscodeCodec { codec } => {
                let codec: VideoCodec = codec.parse()?;
                let (temp, target) = self.file_paths(asset_id, kind, DEFAULT_CONTAINER);
                let args = self.file_args(
                    input,
                    &[
                        "-c:v".to_string(),
                        codec.encoder().to_string(),
                        "-c:a".to_string(),
                        "copy".to_string(),
                    ],
                    &temp,
                );
                let mut plan =
                    self.file_plan(kind, args, temp, target, DEFAULT_CONTAINER.to_string());
                plan.timeout = self.transcode_timeout;
                Ok(plan)
            }
            TransformRequest::ToSegmented => {
                let root = self.segment_root(asset_id, kind);
                let manifest = root.join(MANIFEST_NAME);
                let invocation = self.segment_invocation(input, &root, &[]);
                Ok(JobPlan {
                    kind,
                    invocations: vec![invocation],
                    artifact: PlannedArtifact::Directory { root, manifest },
                    master: None,
                    format: SEGMENTED_FORMAT.to_string(),
                    timeout: self.default_timeout,
                })
            }
            TransformRequest::ToSegmentedMultiBitrate => {
                let root = self.segment_root(asset_id, kind);
                let invocations = BITRATE_LADDER
                    .iter()
                    .map(|rung| {
                        let rung_dir = root.join(rung.name);
                        let extra = [
                            "-b:v".to_string(),
                            rung.bitrate_arg(),
                            "-s".to_string(),
                            rung.resolution(),
                        ];
                        self.segment_invocation(input, &rung_dir, &extra)
                    })
                    .collect();
                let manifest = root.join(MASTER_MANIFEST_NAME);
                let master = MasterPlaylist {
                    path: manifest.clone(),
                    contents: render_master_playlist(&BITRATE_LADDER),
                };
                Ok(JobPlan {
                    kind,
                    invocations,
                    artifact: PlannedArtifact::Directory { root, manifest },
                    master: Some(master),
                    format: SEGMENTED_FORMAT.to_string(),
                    timeout: self.default_timeout,
                })
            }
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            self.log_level.clone(),
        ]
    }

    fn file_paths(&self, asset_id: &str, kind: OperationKind, container: &str) -> (PathBuf, PathBuf) {
        let temp = self
            .storage_dir
            .join(format!("{asset_id}_{}.{container}", kind.temp_suffix()));
        let target = self.storage_dir.join(format!("{asset_id}.{container}"));
        (temp, target)
    }

    fn file_args(&self, input: &Path, options: &[String], output: &Path) -> Vec<String> {
        let mut args = self.base_args();
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());
        args.extend(options.iter().cloned());
        args.push(output.to_string_lossy().to_string());
        args
    }

    fn file_plan(
        &self,
        kind: OperationKind,
        args: Vec<String>,
        temp: PathBuf,
        target: PathBuf,
        format: String,
    ) -> JobPlan {
        JobPlan {
            kind,
            invocations: vec![Invocation {
                program: self.ffmpeg.clone(),
                args,
                outputs: vec![temp.clone()],
            }],
            artifact: PlannedArtifact::File { temp, target },
            master: None,
            format,
            timeout: self.default_timeout,
        }
    }

    fn segment_root(&self, asset_id: &str, kind: OperationKind) -> PathBuf {
        let tag = Uuid::new_v4().simple().to_string();
        self.storage_dir
            .join(format!("{asset_id}_{}_{}", kind.temp_suffix(), &tag[..12]))
    }

    fn segment_invocation(&self, input: &Path, dir: &Path, rung_args: &[String]) -> Invocation {
        let manifest = dir.join(MANIFEST_NAME);
        let mut args = self.base_args();
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());
        args.push("-codec:v".to_string());
        args.push(self.video_codec.clone());
        args.extend(rung_args.iter().cloned());
        args.extend([
            "-codec:a".to_string(),
            self.audio_codec.clone(),
            "-start_number".to_string(),
            "0".to_string(),
            "-hls_time".to_string(),
            self.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            "0".to_string(),
            "-hls_segment_filename".to_string(),
            dir.join(SEGMENT_PATTERN).to_string_lossy().to_string(),
            "-f".to_string(),
            "hls".to_string(),
            manifest.to_string_lossy().to_string(),
        ]);
        Invocation {
            program: self.ffmpeg.clone(),
            args,
            outputs: vec![manifest],
        }
    }
}

/// Parameter checks that need no filesystem access. The orchestrator runs
/// these before touching persisted state.
pub fn validate_request(request: &TransformRequest) -> TransformResult<()> {
    match request {
        TransformRequest::Resize { width, height } => {
            check_dimension("width", *width)?;
            check_dimension("height", *height)
        }
        TransformRequest::CutByTime { start, end } => parse_cut_range(start, end).map(|_| ()),
        TransformRequest::TranscodeCodec { codec } => codec.parse::<VideoCodec>().map(|_| ()),
        TransformRequest::ToGif
        | TransformRequest::ToSegmented
        | TransformRequest::ToSegmentedMultiBitrate => Ok(()),
    }
}

fn check_dimension(label: &str, value: u32) -> TransformResult<()> {
    if value % 2 != 0 {
        return Err(TransformError::InvalidParams(format!(
            "{label} must be an even number, got {value}"
        )));
    }
    if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
        return Err(TransformError::InvalidParams(format!(
            "{label} must be within {MIN_DIMENSION}..={MAX_DIMENSION}, got {value}"
        )));
    }
    Ok(())
}

/// Parses `HH:MM:SS` or a bare number of seconds into milliseconds.
pub fn parse_timestamp(value: &str) -> TransformResult<u64> {
    let invalid = || TransformError::InvalidParams(format!("invalid time format: `{value}`"));
    let parts: Vec<&str> = value.trim().split(':').collect();
    let numbers = parts
        .iter()
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse::<u64>().map_err(|_| invalid())
        })
        .collect::<TransformResult<Vec<u64>>>()?;
    let seconds = match numbers.as_slice() {
        [seconds] => *seconds,
        [hours, minutes, seconds] if *minutes < 60 && *seconds < 60 => hours
            .checked_mul(3600)
            .and_then(|total| total.checked_add(minutes * 60 + seconds))
            .ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    seconds.checked_mul(1000).ok_or_else(invalid)
}

fn parse_cut_range(start: &str, end: &str) -> TransformResult<(u64, u64)> {
    let start_ms = parse_timestamp(start)?;
    let end_ms = parse_timestamp(end)?;
    if end_ms <= start_ms {
        return Err(TransformError::InvalidParams(format!(
            "end `{end}` must be after start `{start}`"
        )));
    }
    Ok((start_ms, end_ms))
}

fn format_seconds(millis: u64) -> String {
    format!("{}.{:03}", millis / 1000, millis % 1000)
}

fn container_of(input: &Path) -> String {
    if is_manifest(input) {
        return DEFAULT_CONTAINER.to_string();
    }
    input
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTAINER.to_string())
}

pub fn render_master_playlist(rungs: &[Rung]) -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rung in rungs {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n",
            rung.bitrate_kbps * 1000,
            rung.resolution()
        ));
        playlist.push_str(&format!("{}/{}\n", rung.name, MANIFEST_NAME));
    }
    playlist
}
