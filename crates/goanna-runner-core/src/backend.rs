use crate::config::RunnerConfig;
use crate::error::{ProcessError, RunnerError};
use crate::output::OutputBuffer;
use crate::process::{ProcessHandle, ProcessStatus, TerminationResult};
use crate::profile::ProfileContext;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Outcome of one liveness probe while a process is starting
#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    /// The process is up and responsive
    Ready,
    /// Launched but not observable yet
    Pending,
    /// The process is already gone
    Exited(ProcessStatus),
}

/// Environment-specific half of a runner: how to bring one process up,
/// probe it, and take it down.
///
/// The supervisor owns the lifecycle state machine and calls into the backend
/// at fixed points:
/// - `prepare` and `launch` during `start()`
/// - `probe` until the process is ready or the startup timeout elapses
/// - `terminate` and `teardown` on every path out of a live state
/// - `reaped` instead of `terminate` when the process already exited
///
/// `teardown` runs after crashes and failed starts too, so anything installed
/// in `prepare` must be undone there.
#[async_trait]
pub trait ProcessBackend: Send + Sync + 'static {
    /// The type of process handle returned by this backend
    type Handle: ProcessHandle + 'static;

    /// Short description for logs
    fn describe(&self) -> String;

    /// Work done before the process is launched
    async fn prepare(&self, _profile: &ProfileContext) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Launch the process, wiring its output into `output`
    async fn launch(
        &self,
        profile: &ProfileContext,
        output: OutputBuffer,
    ) -> Result<Self::Handle, RunnerError>;

    async fn probe(&self, handle: &mut Self::Handle) -> Result<Liveness, RunnerError> {
        match handle.try_wait().await {
            Ok(None) => Ok(Liveness::Ready),
            Ok(Some(status)) => Ok(Liveness::Exited(status)),
            Err(ProcessError::ChannelLost(message)) => Err(RunnerError::ChannelLost(message)),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the process, politely first when `graceful` is set
    async fn terminate(
        &self,
        handle: &mut Self::Handle,
        graceful: bool,
        grace: Duration,
    ) -> TerminationResult;

    /// Forget a process whose exit was observed without `terminate`
    async fn reaped(&self, _handle: &mut Self::Handle) {}

    /// Undo `prepare`; called with the profile still held
    async fn teardown(&self, _profile: Option<&ProfileContext>) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Factory trait for creating platform-specific local process backends
pub trait LocalBackendFactory {
    /// The type of backend this factory creates
    type Backend: ProcessBackend;

    /// Create a backend that launches `binary` on this host
    fn create_backend(binary: &Path, config: &RunnerConfig) -> Self::Backend;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
