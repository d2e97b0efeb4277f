//! Asset lifecycle: upload, guarded transformation runs, downloads and
//! deletion, all persisted through an [`AssetStore`].
//!
//! A transformation moves an asset from idle (or a previous terminal state)
//! to processing, runs the planned external invocations, commits the new
//! artifact and persists success. Every failure after the processing flag
//! was set is persisted as `processing = false, processing_success = false`
//! before the error is returned.

mod error;
mod upload;

use std::fmt;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::asset::{Asset, AssetStore, AssetView, StoreError};
use crate::config::ForgeConfig;
use crate::transform::command::MANIFEST_NAME;
use crate::transform::{
    archive, find_rung, swap, validate_request, CommandBuilder, CommandExecutor, JobPlan,
    OperationKind, PlannedArtifact, ProcessRunner, TransformRequest,
};

pub use error::{FailureKind, JobError, JobResult};
pub use upload::UploadRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
}

/// Byte payload with a suggested filename.
#[derive(Clone, PartialEq, Eq)]
pub struct Download {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub sha256: String,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("filename", &self.filename)
            .field("bytes", &self.bytes.len())
            .field("sha256", &self.sha256)
            .finish()
    }
}

impl Download {
    fn new(filename: String, bytes: Vec<u8>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&bytes));
        Self {
            filename,
            bytes,
            sha256,
        }
    }
}

pub struct AssetStateMachine {
    store: Arc<dyn AssetStore>,
    config: ForgeConfig,
    builder: CommandBuilder,
    runner: ProcessRunner,
    permits: Arc<Semaphore>,
    failure_log: PathBuf,
}

impl fmt::Debug for AssetStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetStateMachine")
            .field("builder", &self.builder)
            .field("failure_log", &self.failure_log)
            .finish_non_exhaustive()
    }
}

impl AssetStateMachine {
    /// Validates the configuration and resolves the ffmpeg binary. Fails
    /// when the tool cannot be found.
    pub fn new(config: ForgeConfig, store: Arc<dyn AssetStore>) -> JobResult<Self> {
        let ffmpeg = config.validate()?;
        let builder = CommandBuilder::new(&config, ffmpeg);
        let permits = Arc::new(Semaphore::new(config.limits.max_concurrent_jobs as usize));
        let failure_log = config.failure_log_path();
        Ok(Self {
            store,
            builder,
            runner: ProcessRunner::default(),
            permits,
            failure_log,
            config,
        })
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.runner = ProcessRunner::new(Some(executor));
        self
    }

    pub fn failure_log_path(&self) -> &Path {
        &self.failure_log
    }

    pub async fn upload<R>(&self, mut request: UploadRequest<R>) -> JobResult<String>
    where
        R: AsyncRead + Unpin,
    {
        let (logical_name, extension) = upload::split_filename(&request.filename)
            .ok_or_else(|| {
                JobError::UnsupportedMedia(format!("filename `{}` has no extension", request.filename))
            })?;
        if !self.config.upload.accepts(&request.content_type, &extension) {
            return Err(JobError::UnsupportedMedia(format!(
                "content type `{}` with extension `{}` is not accepted",
                request.content_type, extension
            )));
        }

        let id = Uuid::new_v4().to_string();
        let format = extension.to_ascii_lowercase();
        let path = self.config.storage_dir().join(format!("{id}.{format}"));
        let size = upload::receive(&mut request.reader, &path)
            .await
            .map_err(|source| JobError::Io {
                path: path.clone(),
                source,
            })?;

        let asset = Asset::new(id.clone(), logical_name, format, path.clone());
        if let Err(err) = self.store.put(&asset) {
            if let Err(cleanup) = swap::remove_path(&path).await {
                warn!(target: "job", path = %path.display(), error = %cleanup, "failed to remove orphaned upload");
            }
            return Err(err.into());
        }
        info!(target: "job", asset_id = %id, bytes = size, path = %path.display(), "asset uploaded");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> JobResult<AssetView> {
        Ok(self.store.get(id)?.view())
    }

    pub async fn list(&self, limit: usize) -> JobResult<Vec<AssetView>> {
        Ok(self
            .store
            .list(limit)?
            .iter()
            .map(AssetView::from)
            .collect())
    }

    /// Runs one transformation to completion. Returns once the outcome has
    /// been persisted.
    pub async fn run(&self, id: &str, request: TransformRequest) -> JobResult<OperationOutcome> {
        let asset = self.store.get(id)?;
        validate_request(&request)?;
        let mut plan = self
            .builder
            .build(&request, &asset.id, &asset.storage_path)?;
        let kind = plan.kind;

        let started = match self.store.begin_processing(&asset.id, kind.as_str()) {
            Ok(started) => started,
            Err(err) => {
                if matches!(err, StoreError::Conflict { .. }) {
                    warn!(target: "job", asset_id = %asset.id, operation = %kind, "operation rejected; asset busy");
                }
                return Err(err.into());
            }
        };
        info!(
            target: "job",
            asset_id = %started.id,
            operation = %kind,
            input = %started.storage_path.display(),
            "operation started"
        );

        // A commit may have landed between the read and the flag flip; the
        // plan must consume the artifact the flag now guards.
        if started.storage_path != asset.storage_path {
            debug!(
                target: "job",
                asset_id = %started.id,
                stale = %asset.storage_path.display(),
                current = %started.storage_path.display(),
                "artifact moved before start; replanning"
            );
            plan = match self
                .builder
                .build(&request, &started.id, &started.storage_path)
            {
                Ok(plan) => plan,
                Err(err) => {
                    let err = JobError::from(err);
                    self.record_failure(&started.id, &plan, &err).await;
                    return Err(err);
                }
            };
        }

        let task = tokio::spawn(execute(
            self.runner.clone(),
            Arc::clone(&self.permits),
            plan.clone(),
        ));
        let result = match task.await {
            Ok(result) => result,
            Err(join) => Err(JobError::Aborted(join.to_string())),
        };

        match result {
            Ok(canonical) => self.commit(started, canonical, &plan).await,
            Err(err) => {
                self.record_failure(&started.id, &plan, &err).await;
                Err(err)
            }
        }
    }

    async fn commit(
        &self,
        started: Asset,
        canonical: PathBuf,
        plan: &JobPlan,
    ) -> JobResult<OperationOutcome> {
        let previous_root = started.artifact_root().to_path_buf();
        let mut updated = started;
        updated.storage_path = canonical;
        updated.format = plan.format.clone();
        updated.processing = false;
        updated.processing_success = Some(true);

        if let Err(err) = self.store.put(&updated) {
            let err = JobError::from(err);
            self.record_failure(&updated.id, plan, &err).await;
            return Err(err);
        }
        info!(
            target: "job",
            asset_id = %updated.id,
            operation = %plan.kind,
            path = %updated.storage_path.display(),
            format = %updated.format,
            "operation succeeded"
        );

        if previous_root != updated.artifact_root() {
            if let Err(err) = swap::remove_path(&previous_root).await {
                warn!(
                    target: "job",
                    asset_id = %updated.id,
                    path = %previous_root.display(),
                    error = %err,
                    "failed to remove superseded artifact"
                );
            }
        }
        Ok(OperationOutcome { success: true })
    }

    /// Persists the failed terminal state. The record is re-read so that the
    /// canonical path and format are the ones last committed.
    async fn record_failure(&self, id: &str, plan: &JobPlan, cause: &JobError) {
        swap::discard(&plan.artifact).await;
        match self.store.get(id) {
            Ok(mut current) => {
                current.processing = false;
                current.processing_success = Some(false);
                if let Err(err) = self.store.put(&current) {
                    error!(target: "job", asset_id = %id, error = %err, "failed to persist failure state");
                }
            }
            Err(err) => {
                error!(target: "job", asset_id = %id, error = %err, "failed to reload asset after failure");
            }
        }
        warn!(
            target: "job",
            asset_id = %id,
            operation = %plan.kind,
            kind = cause.kind().as_str(),
            error = %cause,
            "operation failed"
        );
        self.log_failure(plan.kind, id, cause);
    }

    fn log_failure(&self, operation: OperationKind, id: &str, cause: &JobError) {
        if let Some(parent) = self.failure_log.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failure_log)
        {
            let detail = match cause {
                JobError::Transform(err) => err
                    .captured_output()
                    .filter(|stderr| !stderr.is_empty())
                    .map(|stderr| format!(" stderr: {}", stderr.replace('\n', " | ")))
                    .unwrap_or_default(),
                _ => String::new(),
            };
            let _ = writeln!(
                file,
                "{} [{}] {} {}{}",
                Utc::now().to_rfc3339(),
                operation,
                id,
                cause,
                detail
            );
        }
    }

    pub async fn download(&self, id: &str) -> JobResult<Download> {
        let asset = self.store.get(id)?;
        if asset.is_segmented() {
            return Err(JobError::InvalidParams(format!(
                "asset {id} is segmented; fetch its archive instead"
            )));
        }
        let bytes = read_artifact(&asset).await?;
        Ok(Download::new(asset.download_name(), bytes))
    }

    /// Zips a segmented asset's manifest with its segments. With `rung`,
    /// only that rendition of a multi-bitrate output is packed.
    pub async fn fetch_archive(&self, id: &str, rung: Option<&str>) -> JobResult<Download> {
        let asset = self.store.get(id)?;
        if !asset.is_segmented() {
            return Err(JobError::InvalidParams(format!(
                "asset {id} has no segmented output"
            )));
        }
        let (manifest, filename) = match rung {
            None => (asset.storage_path.clone(), format!("{}_hls.zip", asset.id)),
            Some(requested) => {
                let unknown = || JobError::UnknownRung {
                    id: asset.id.clone(),
                    rung: requested.to_string(),
                };
                let rung = find_rung(requested).ok_or_else(unknown)?;
                let manifest = asset.artifact_root().join(rung.name).join(MANIFEST_NAME);
                if !manifest.is_file() {
                    return Err(unknown());
                }
                (manifest, format!("{}_{}_hls.zip", asset.id, rung.name))
            }
        };

        let bytes = tokio::task::spawn_blocking(move || archive::archive(&manifest))
            .await
            .map_err(|join| JobError::Aborted(join.to_string()))??;
        info!(target: "job", asset_id = %asset.id, archive = %filename, bytes = bytes.len(), "archive built");
        Ok(Download::new(filename, bytes))
    }

    /// Removes the backing artifact, then the record. A failure to remove
    /// the artifact leaves the record in place.
    pub async fn delete(&self, id: &str) -> JobResult<()> {
        let asset = self.store.get(id)?;
        if asset.processing {
            return Err(StoreError::Conflict { id: asset.id }.into());
        }
        let root = asset.artifact_root().to_path_buf();
        swap::remove_path(&root)
            .await
            .map_err(|source| JobError::Io {
                path: root.clone(),
                source,
            })?;
        self.store.remove(&asset)?;
        info!(target: "job", asset_id = %asset.id, path = %root.display(), "asset deleted");
        Ok(())
    }

    /// Marks every asset left in `processing` by an earlier crash as failed.
    pub async fn recover_stale(&self) -> JobResult<usize> {
        let recovered = self.store.recover_stale()?;
        if recovered > 0 {
            warn!(target: "job", recovered, "stale in-flight operations marked failed");
        }
        Ok(recovered)
    }
}

async fn execute(
    runner: ProcessRunner,
    permits: Arc<Semaphore>,
    plan: JobPlan,
) -> JobResult<PathBuf> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| JobError::Aborted("worker pool closed".to_string()))?;
    prepare_outputs(&plan).await?;
    let outputs = runner.run_all(&plan.invocations, plan.timeout).await?;
    debug!(target: "job", operation = %plan.kind, outputs = outputs.len(), "invocations finished");
    if let Some(master) = &plan.master {
        tokio::fs::write(&master.path, &master.contents)
            .await
            .map_err(|source| JobError::Io {
                path: master.path.clone(),
                source,
            })?;
    }
    Ok(swap::promote(&plan.artifact).await?)
}

async fn prepare_outputs(plan: &JobPlan) -> JobResult<()> {
    let mut directories: Vec<&Path> = plan
        .invocations
        .iter()
        .flat_map(|invocation| invocation.outputs.iter())
        .filter_map(|output| output.parent())
        .collect();
    if let PlannedArtifact::Directory { root, .. } = &plan.artifact {
        directories.push(root);
    }
    for dir in directories {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| JobError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

async fn read_artifact(asset: &Asset) -> JobResult<Vec<u8>> {
    tokio::fs::read(&asset.storage_path)
        .await
        .map_err(|source| match source.kind() {
            ErrorKind::NotFound => JobError::MissingArtifact {
                id: asset.id.clone(),
                path: asset.storage_path.clone(),
            },
            _ => JobError::Io {
                path: asset.storage_path.clone(),
                source,
            },
        })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::asset::{AssetState, SqliteAssetStore, StoreResult};
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::process::Command;

    /// Records every argument vector and reports success. Writes the last
    /// argument as the output file only when asked to.
    struct FakeFfmpeg {
        calls: Mutex<Vec<Vec<String>>>,
        writes_output: bool,
    }

    impl FakeFfmpeg {
        fn new(writes_output: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                writes_output,
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CommandExecutor for FakeFfmpeg {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let args: Vec<String> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();
            if self.writes_output {
                if let Some(output) = args.last() {
                    std::fs::write(output, b"encoded")?;
                }
            }
            self.calls.lock().unwrap().push(args);
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    /// Commits a different artifact for the asset right before the
    /// processing flag is taken, as a concurrent operation would.
    struct MovingStore {
        inner: SqliteAssetStore,
        move_to: Mutex<Option<(PathBuf, String)>>,
    }

    impl AssetStore for MovingStore {
        fn get(&self, id: &str) -> StoreResult<Asset> {
            self.inner.get(id)
        }

        fn put(&self, asset: &Asset) -> StoreResult<Asset> {
            self.inner.put(asset)
        }

        fn remove(&self, asset: &Asset) -> StoreResult<()> {
            self.inner.remove(asset)
        }

        fn list(&self, limit: usize) -> StoreResult<Vec<Asset>> {
            self.inner.list(limit)
        }

        fn begin_processing(&self, id: &str, operation: &str) -> StoreResult<Asset> {
            if let Some((path, format)) = self.move_to.lock().unwrap().take() {
                let mut moved = self.inner.get(id)?;
                moved.storage_path = path;
                moved.format = format;
                self.inner.put(&moved)?;
            }
            self.inner.begin_processing(id, operation)
        }

        fn recover_stale(&self) -> StoreResult<usize> {
            self.inner.recover_stale()
        }
    }

    fn config(dir: &TempDir) -> ForgeConfig {
        let root = dir.path();
        let ffmpeg = root.join("ffmpeg");
        std::fs::write(&ffmpeg, b"").unwrap();
        toml::from_str(&format!(
            r#"
[paths]
storage_dir = "{root}/videos"
data_dir = "{root}/data"
logs_dir = "{root}/logs"

[tools]
ffmpeg = "{ffmpeg}"

[limits]
max_concurrent_jobs = 1
default_timeout_seconds = 5
transcode_timeout_seconds = 5
"#,
            root = root.display(),
            ffmpeg = ffmpeg.display()
        ))
        .unwrap()
    }

    fn sqlite_store(config: &ForgeConfig) -> SqliteAssetStore {
        let store = SqliteAssetStore::new(config.database_path()).unwrap();
        store.initialize().unwrap();
        store
    }

    fn machine(dir: &TempDir) -> (AssetStateMachine, Arc<FakeFfmpeg>) {
        let config = config(dir);
        let store = sqlite_store(&config);
        let executor = FakeFfmpeg::new(false);
        let machine = AssetStateMachine::new(config, Arc::new(store))
            .unwrap()
            .with_executor(executor.clone());
        (machine, executor)
    }

    #[tokio::test]
    async fn missing_output_after_clean_exit_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let (machine, executor) = machine(&dir);
        let mut payload: &[u8] = b"frames";
        let id = machine
            .upload(UploadRequest::new("intro.mp4", "video/mp4", &mut payload))
            .await
            .unwrap();

        let err = machine.run(&id, TransformRequest::ToGif).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::IoError);
        assert_eq!(executor.calls().len(), 1);

        let view = machine.get(&id).await.unwrap();
        assert_eq!(view.format, "mp4");
        assert!(!view.processing);
        assert_eq!(view.processing_success, Some(false));

        let log = std::fs::read_to_string(machine.failure_log_path()).unwrap();
        assert!(log.contains("[to_gif]"));
        assert!(log.contains(&id));
    }

    #[tokio::test]
    async fn invalid_parameters_never_reach_the_executor() {
        let dir = TempDir::new().unwrap();
        let (machine, executor) = machine(&dir);
        let mut payload: &[u8] = b"frames";
        let id = machine
            .upload(UploadRequest::new("intro.mp4", "video/mp4", &mut payload))
            .await
            .unwrap();

        let err = machine
            .run(&id, TransformRequest::Resize { width: 201, height: 400 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidParams);
        assert!(executor.calls().is_empty());
        let store = SqliteAssetStore::new(dir.path().join("data/assets.sqlite")).unwrap();
        assert_eq!(store.get(&id).unwrap().state(), AssetState::Idle);
    }

    #[tokio::test]
    async fn artifact_moved_before_start_is_the_one_processed() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let storage = config.storage_dir();
        let store = Arc::new(MovingStore {
            inner: sqlite_store(&config),
            move_to: Mutex::new(None),
        });
        let executor = FakeFfmpeg::new(true);
        let machine = AssetStateMachine::new(config, store.clone())
            .unwrap()
            .with_executor(executor.clone());

        let mut payload: &[u8] = b"frames";
        let id = machine
            .upload(UploadRequest::new("intro.mp4", "video/mp4", &mut payload))
            .await
            .unwrap();
        let moved = storage.join(format!("{id}.mov"));
        std::fs::write(&moved, b"newer frames").unwrap();
        *store.move_to.lock().unwrap() = Some((moved.clone(), "mov".to_string()));

        let outcome = machine
            .run(&id, TransformRequest::Resize { width: 640, height: 360 })
            .await
            .unwrap();
        assert!(outcome.success);

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        let input = calls[0]
            .iter()
            .position(|arg| arg == "-i")
            .map(|index| calls[0][index + 1].clone());
        assert_eq!(input.as_deref(), moved.to_str());

        let asset = store.get(&id).unwrap();
        assert_eq!(asset.storage_path, moved);
        assert_eq!(asset.format, "mov");
        assert_eq!(asset.state(), AssetState::Succeeded);
        assert_eq!(std::fs::read(&moved).unwrap(), b"encoded");
    }

    #[tokio::test]
    async fn uploads_need_matching_type_and_extension() {
        let dir = TempDir::new().unwrap();
        let (machine, _) = machine(&dir);
        for (name, content_type) in [
            ("intro.mov", "video/mp4"),
            ("intro.mp4", "video/quicktime"),
            ("intro", "video/mp4"),
        ] {
            let mut payload: &[u8] = b"frames";
            let err = machine
                .upload(UploadRequest::new(name, content_type, &mut payload))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), FailureKind::InvalidParams, "{name} {content_type}");
        }
        assert!(machine.list(10).await.unwrap().is_empty());
    }
}
