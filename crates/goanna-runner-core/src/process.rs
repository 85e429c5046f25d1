use crate::error::ProcessError;
use crate::output::OutputBuffer;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a process after termination
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process exited with status information
    Exited(std::process::ExitStatus),
    /// Process is gone but no exit status is observable (killed, or a device process)
    Terminated,
    /// Process failed to start or encountered an error
    Failed(String),
    /// Process status is unknown
    Unknown,
}

impl ProcessStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited(status) => status.code(),
            _ => None,
        }
    }

    /// True only for an observed exit with a success status
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, ProcessStatus::Exited(status) if status.success())
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Exited(status) => write!(f, "exited ({status})"),
            ProcessStatus::Terminated => write!(f, "terminated"),
            ProcessStatus::Failed(message) => write!(f, "failed: {message}"),
            ProcessStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    PermissionDenied,
    /// Operation timed out
    Timeout,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// The process is gone, whether we killed it or it was already dead
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Trait representing a handle to a running process, local or device-resident
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if not known yet or the process has exited)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Get the arguments passed to this process
    fn get_args(&self) -> &[String];

    /// When the process was launched
    fn started_at(&self) -> Instant;

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>, ProcessError>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus, ProcessError>;

    /// Kill the process (platform-specific implementation)
    async fn kill(&mut self) -> Result<(), ProcessError>;
}

/// Core trait for process lifecycle management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// The type of process handle this lifecycle manager produces
    type Handle: ProcessHandle;

    /// Spawn a new process, streaming its stdout and stderr into `output`
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
        output: OutputBuffer,
    ) -> Result<Self::Handle>;
}

/// Trait for comprehensive process termination including process trees
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask a process to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a process and everything it spawned (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all descendant processes of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Graceful request first, escalating to a force kill once `grace` elapses
    async fn terminate_with_grace(
        &self,
        handle: &mut dyn ProcessHandle,
        grace: Duration,
    ) -> TerminationResult {
        match self.terminate_gracefully(handle).await {
            TerminationResult::ProcessNotFound => return TerminationResult::ProcessNotFound,
            TerminationResult::Success => {
                if let Ok(Ok(status)) = tokio::time::timeout(grace, handle.wait()).await {
                    debug!(%status, "Process exited within grace period");
                    return TerminationResult::Success;
                }
                warn!(?grace, "Process ignored graceful termination, escalating");
            }
            other => {
                warn!(result = ?other, "Graceful termination failed, escalating");
            }
        }

        self.force_kill(handle).await
    }
}

/// High-level process manager trait that combines lifecycle and termination
#[async_trait]
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;

    /// Cleanup any resources held by the process manager
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_result_is_gone() {
        assert!(TerminationResult::Success.is_gone());
        assert!(TerminationResult::ProcessNotFound.is_gone());
        assert!(!TerminationResult::PermissionDenied.is_gone());
        assert!(!TerminationResult::Failed("nope".to_string()).is_gone());
    }

    #[test]
    fn test_status_without_exit_is_not_clean() {
        assert!(!ProcessStatus::Terminated.is_clean_exit());
        assert!(!ProcessStatus::Unknown.is_clean_exit());
        assert_eq!(ProcessStatus::Terminated.code(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_classification() {
        use std::os::unix::process::ExitStatusExt;

        let clean = ProcessStatus::Exited(std::process::ExitStatus::from_raw(0));
        assert!(clean.is_clean_exit());
        assert_eq!(clean.code(), Some(0));

        // raw wait status 3 << 8 is "exited with code 3"
        let failed = ProcessStatus::Exited(std::process::ExitStatus::from_raw(3 << 8));
        assert!(!failed.is_clean_exit());
        assert_eq!(failed.code(), Some(3));
    }

    #[test]
    fn test_process_id_display() {
        assert_eq!(ProcessId::from(4242).to_string(), "4242");
    }
}
