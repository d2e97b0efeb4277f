use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use clipforge_core::{
    load_forge_config, AssetStateMachine, AssetView, Download, ForgeConfig, JobError,
    OperationOutcome, SqliteAssetStore, TransformRequest, UploadRequest, BITRATE_LADDER,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] clipforge_core::ConfigError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("store error: {0}")]
    Store(#[from] clipforge_core::StoreError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("runtime error: {0}")]
    Runtime(std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

impl AppError {
    /// Line printed before exiting non-zero. Job failures carry their class
    /// so scripts can tell a missing asset from a broken encode.
    pub fn operator_message(&self) -> String {
        match self {
            AppError::Job(err) => format!("{} ({})", err, err.kind().as_str()),
            other => other.to_string(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "ClipForge media asset control interface", long_about = None)]
pub struct Cli {
    /// Path to clipforge.toml
    #[arg(long, default_value = "configs/clipforge.toml")]
    pub config: PathBuf,
    /// Override for paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternative path for assets.sqlite
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Override for tools.ffmpeg
    #[arg(long)]
    pub ffmpeg: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stores a media file as a new asset
    Upload(UploadArgs),
    /// Shows one asset
    Show(AssetArgs),
    /// Lists the most recently updated assets
    List(ListArgs),
    /// Scales an asset to the given dimensions
    Resize(ResizeArgs),
    /// Converts an asset to an animated GIF
    Gif(AssetArgs),
    /// Keeps only the range between two timestamps
    Cut(CutArgs),
    /// Re-encodes the video stream with another codec
    Transcode(TranscodeArgs),
    /// Packages an asset as HLS segments
    Segment(SegmentArgs),
    /// Writes the asset's file to disk
    Download(DownloadArgs),
    /// Writes a zip of the asset's segmented output to disk
    Archive(ArchiveArgs),
    /// Removes an asset and its files
    Delete(AssetArgs),
    /// Marks operations interrupted by a crash as failed
    Recover,
    /// Runs basic integrity checks
    Health,
    /// Prints shell completions
    Completions(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct AssetArgs {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    pub file: PathBuf,
    /// Declared content type; guessed from the accepted media list when omitted
    #[arg(long)]
    pub content_type: Option<String>,
    /// Declared filename; defaults to the file's own name
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct ResizeArgs {
    pub id: String,
    #[arg(long)]
    pub width: u32,
    #[arg(long)]
    pub height: u32,
}

#[derive(Args, Debug)]
pub struct CutArgs {
    pub id: String,
    /// HH:MM:SS or seconds
    #[arg(long)]
    pub start: String,
    /// HH:MM:SS or seconds
    #[arg(long)]
    pub end: String,
}

#[derive(Args, Debug)]
pub struct TranscodeArgs {
    pub id: String,
    /// h264, h265, vp9 or xvid
    #[arg(long)]
    pub codec: String,
}

#[derive(Args, Debug)]
pub struct SegmentArgs {
    pub id: String,
    /// Produce the full bitrate ladder and a master playlist
    #[arg(long, default_value_t = false)]
    pub multi_bitrate: bool,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    pub id: String,
    /// Destination file; defaults to the suggested filename in the current directory
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    pub id: String,
    /// Single rendition of a multi-bitrate output, e.g. 2400k
    #[arg(long)]
    pub rung: Option<String>,
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        write_completions(args.shell, &mut std::io::stdout());
        return Ok(());
    }
    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(AppError::Runtime)?;
    runtime.block_on(context.dispatch(&cli.command, cli.format))
}

pub fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "clipforgectl", out);
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ForgeConfig,
    config_path: PathBuf,
    database_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_forge_config(&config_path)?;
        if let Some(data_dir) = &cli.data_dir {
            config.paths.data_dir = data_dir.to_string_lossy().to_string();
        }
        if let Some(ffmpeg) = &cli.ffmpeg {
            config.tools.ffmpeg = ffmpeg.clone();
        }
        let database_path = cli.db.clone().unwrap_or_else(|| config.database_path());
        Ok(Self {
            config,
            config_path,
            database_path,
        })
    }

    fn machine(&self) -> Result<AssetStateMachine> {
        let store = SqliteAssetStore::builder()
            .path(&self.database_path)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        Ok(AssetStateMachine::new(self.config.clone(), Arc::new(store))?)
    }

    async fn dispatch(&self, command: &Commands, format: OutputFormat) -> Result<()> {
        match command {
            Commands::Upload(args) => {
                let receipt = self.upload(args).await?;
                render(&receipt, format)
            }
            Commands::Show(args) => {
                let view = self.machine()?.get(&args.id).await?;
                render(&view, format)
            }
            Commands::List(args) => {
                let assets = self.machine()?.list(args.limit).await?;
                render(&assets, format)
            }
            Commands::Resize(args) => {
                let request = TransformRequest::Resize {
                    width: args.width,
                    height: args.height,
                };
                self.transform(&args.id, request, format).await
            }
            Commands::Gif(args) => {
                self.transform(&args.id, TransformRequest::ToGif, format)
                    .await
            }
            Commands::Cut(args) => {
                let request = TransformRequest::CutByTime {
                    start: args.start.clone(),
                    end: args.end.clone(),
                };
                self.transform(&args.id, request, format).await
            }
            Commands::Transcode(args) => {
                let request = TransformRequest::TranscodeCodec {
                    codec: args.codec.clone(),
                };
                self.transform(&args.id, request, format).await
            }
            Commands::Segment(args) => {
                let request = if args.multi_bitrate {
                    TransformRequest::ToSegmentedMultiBitrate
                } else {
                    TransformRequest::ToSegmented
                };
                self.transform(&args.id, request, format).await
            }
            Commands::Download(args) => {
                let download = self.machine()?.download(&args.id).await?;
                let receipt = save_download(download, args.out.as_deref())?;
                render(&receipt, format)
            }
            Commands::Archive(args) => {
                let download = self
                    .machine()?
                    .fetch_archive(&args.id, args.rung.as_deref())
                    .await?;
                let receipt = save_download(download, args.out.as_deref())?;
                render(&receipt, format)
            }
            Commands::Delete(args) => {
                self.machine()?.delete(&args.id).await?;
                render(
                    &DeleteReceipt {
                        id: args.id.clone(),
                        deleted: true,
                    },
                    format,
                )
            }
            Commands::Recover => {
                let recovered = self.machine()?.recover_stale().await?;
                render(&RecoveryReport { recovered }, format)
            }
            Commands::Health => {
                let report = self.health_check();
                render(&report, format)?;
                if report
                    .iter()
                    .any(|entry| matches!(entry.status, CheckStatus::Error))
                {
                    return Err(AppError::MissingResource(
                        "one or more checks failed".to_string(),
                    ));
                }
                Ok(())
            }
            Commands::Completions(args) => {
                write_completions(args.shell, &mut std::io::stdout());
                Ok(())
            }
        }
    }

    /// Prints `{success}` for both outcomes; a failure is then returned so
    /// the process exits non-zero.
    async fn transform(
        &self,
        id: &str,
        request: TransformRequest,
        format: OutputFormat,
    ) -> Result<()> {
        let machine = self.machine()?;
        match machine.run(id, request).await {
            Ok(outcome) => render(&outcome, format),
            Err(err) => {
                render(&OperationOutcome { success: false }, format)?;
                Err(err.into())
            }
        }
    }

    async fn upload(&self, args: &UploadArgs) -> Result<UploadReceipt> {
        let declared = match &args.name {
            Some(name) => name.clone(),
            None => args
                .file
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .ok_or_else(|| {
                    AppError::MissingResource(format!("{} has no file name", args.file.display()))
                })?,
        };
        let content_type = args
            .content_type
            .clone()
            .unwrap_or_else(|| self.guess_content_type(&declared));
        let file = tokio::fs::File::open(&args.file)
            .await
            .map_err(|source| AppError::Io {
                path: args.file.clone(),
                source,
            })?;
        debug!(file = %args.file.display(), content_type = %content_type, "uploading");
        let id = self
            .machine()?
            .upload(UploadRequest::new(declared, content_type, file))
            .await?;
        Ok(UploadReceipt { id })
    }

    fn guess_content_type(&self, filename: &str) -> String {
        let extension = Path::new(filename)
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();
        self.config
            .upload
            .accepted
            .iter()
            .find(|media| media.extension.eq_ignore_ascii_case(&extension))
            .map(|media| media.content_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string())
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("clipforge.toml", &self.config_path));
        results.push(self.check_database("assets.sqlite", &self.database_path));
        results.push(self.check_directory("storage", &self.config.storage_dir()));
        results.push(self.check_directory("logs", Path::new(&self.config.paths.logs_dir)));
        results.push(match self.config.tools.resolve_ffmpeg() {
            Ok(path) => HealthEntry::ok("ffmpeg", path.display().to_string()),
            Err(err) => HealthEntry::error("ffmpeg", err.to_string()),
        });
        results.push(HealthEntry::ok(
            "bitrate ladder",
            BITRATE_LADDER
                .iter()
                .map(|rung| rung.name)
                .collect::<Vec<_>>()
                .join(", "),
        ));
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{path} not found", path = path.display()));
        }
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }
}

fn save_download(download: Download, out: Option<&Path>) -> Result<DownloadReceipt> {
    let path = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&download.filename));
    fs::write(&path, &download.bytes).map_err(|source| AppError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(DownloadReceipt {
        filename: download.filename,
        path,
        bytes: download.bytes.len(),
        sha256: download.sha256,
    })
}

#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadReceipt {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteReceipt {
    pub id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct RecoveryReport {
    pub recovered: usize,
}

impl DisplayFallback for UploadReceipt {
    fn display(&self) -> String {
        self.id.clone()
    }
}

impl DisplayFallback for OperationOutcome {
    fn display(&self) -> String {
        if self.success {
            "success".to_string()
        } else {
            "failed".to_string()
        }
    }
}

impl DisplayFallback for AssetView {
    fn display(&self) -> String {
        let state = match (self.processing, self.processing_success) {
            (true, _) => "processing",
            (false, None) => "idle",
            (false, Some(true)) => "succeeded",
            (false, Some(false)) => "failed",
        };
        format!(
            "{id} | {name}.{format} | {state}",
            id = self.id,
            name = self.filename,
            format = self.format,
        )
    }
}

impl DisplayFallback for Vec<AssetView> {
    fn display(&self) -> String {
        if self.is_empty() {
            return "No assets found".to_string();
        }
        self.iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for DownloadReceipt {
    fn display(&self) -> String {
        format!(
            "{} ({} bytes, sha256 {}) -> {}",
            self.filename,
            self.bytes,
            self.sha256,
            self.path.display()
        )
    }
}

impl DisplayFallback for DeleteReceipt {
    fn display(&self) -> String {
        format!("deleted {}", self.id)
    }
}

impl DisplayFallback for RecoveryReport {
    fn display(&self) -> String {
        format!("{} stale operation(s) marked failed", self.recovered)
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "[{status}] {name}: {detail}",
                    status = entry.status,
                    name = entry.name,
                    detail = entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}
