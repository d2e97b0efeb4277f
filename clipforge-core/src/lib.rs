pub mod asset;
pub mod config;
pub mod error;
pub mod job;
pub mod transform;

pub use asset::{
    Asset, AssetState, AssetStore, AssetView, SqliteAssetStore, SqliteAssetStoreBuilder,
    StoreError, StoreResult,
};
pub use config::{load_forge_config, ForgeConfig};
pub use error::{ConfigError, Result};
pub use job::{
    AssetStateMachine, Download, FailureKind, JobError, JobResult, OperationOutcome,
    UploadRequest,
};
pub use transform::{
    ArchiveError, CommandBuilder, CommandExecutor, OperationKind, ProcessRunner, SwapError,
    SystemCommandExecutor, TransformError, TransformRequest, VideoCodec, BITRATE_LADDER,
};
