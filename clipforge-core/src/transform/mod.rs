pub mod archive;
pub mod command;
pub mod error;
pub mod runner;
pub mod swap;

pub use command::{
    find_rung, validate_request, CommandBuilder, Invocation, JobPlan, MasterPlaylist,
    OperationKind, PlannedArtifact, Rung, TransformRequest, VideoCodec, BITRATE_LADDER,
};
pub use error::{ArchiveError, SwapError, TransformError, TransformResult};
pub use runner::{CommandExecutor, ProcessRunner, SystemCommandExecutor};
