mod monitor;
mod supervisor;

pub use supervisor::Supervisor;

use crate::error::RunnerError;
use crate::process::ProcessStatus;
use crate::state::{CrashReason, RunnerState};
use async_trait::async_trait;
use std::time::Duration;

/// Result of waiting on a runner
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The process is gone; carries the last observed status
    Exited(ProcessStatus),
    /// The wait timed out; the process was left alone
    TimedOut,
}

/// Lifecycle contract shared by every runner variant.
///
/// All methods take `&self`, so one runner can be shared between a caller
/// driving it and tasks observing it. Lifecycle calls are serialized
/// internally.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Launch the process and wait until it is responsive
    async fn start(&self) -> Result<(), RunnerError>;

    /// Stop the process and release the profile; a no-op once stopped
    async fn stop(&self, graceful: bool) -> Result<(), RunnerError>;

    /// Wait for the process to end, at most `timeout` if given
    async fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, RunnerError>;

    fn is_running(&self) -> bool;

    fn state(&self) -> RunnerState;

    /// Everything the process printed during the current run
    fn output(&self) -> Vec<String>;

    fn crashed(&self) -> bool;

    fn crash_reason(&self) -> Option<CrashReason>;
}
