use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::command::Invocation;
use super::error::{TransformError, TransformResult};

const STDERR_TAIL_BYTES: usize = 4096;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.output().await
    }
}

/// Executes planned invocations under a deadline. The child is killed when
/// the deadline elapses because the future owning it is dropped.
#[derive(Clone)]
pub struct ProcessRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRunner").finish_non_exhaustive()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProcessRunner {
    pub fn new(executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
        }
    }

    /// Returns the invocation's declared outputs once the process exits 0.
    pub async fn run(
        &self,
        invocation: &Invocation,
        limit: Duration,
    ) -> TransformResult<Vec<PathBuf>> {
        let program = invocation.program_name();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(target: "transform.runner", command = %invocation.command_line(), "spawning");
        let started = Instant::now();
        let output = match timeout(limit, self.executor.run(&mut command)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(TransformError::Spawn { program, source }),
            Err(_) => {
                warn!(
                    target: "transform.runner",
                    program = %program,
                    limit_secs = limit.as_secs(),
                    "process exceeded its deadline"
                );
                return Err(TransformError::Timeout { program, limit });
            }
        };

        let stderr = stderr_tail(&output.stderr);
        if output.status.success() {
            debug!(
                target: "transform.runner",
                program = %program,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "process finished"
            );
            return Ok(invocation.outputs.clone());
        }
        match output.status.code() {
            Some(code) => Err(TransformError::Exit {
                program,
                status: Some(code),
                stderr,
            }),
            None => Err(TransformError::Signal {
                program,
                signal: termination_signal(&output.status),
                stderr,
            }),
        }
    }

    /// Runs invocations in order; the first failure aborts the rest.
    pub async fn run_all(
        &self,
        invocations: &[Invocation],
        limit: Duration,
    ) -> TransformResult<Vec<PathBuf>> {
        let mut outputs = Vec::new();
        for invocation in invocations {
            outputs.extend(self.run(invocation, limit).await?);
        }
        Ok(outputs)
    }
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn stderr_tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
