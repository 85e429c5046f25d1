use crate::state::{CrashReason, RunnerState};
use std::time::Duration;
use thiserror::Error;

/// Core error types for runner operations
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Unsupported target: app={app:?}, bin={bin:?}")]
    UnsupportedTarget {
        app: Option<String>,
        bin: Option<String>,
    },

    #[error("Process did not become responsive within {0:?}")]
    StartupTimeout(Duration),

    #[error("Runner is already running")]
    AlreadyRunning,

    #[error("Cannot {operation} while runner is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: RunnerState,
    },

    #[error("Process crashed: {0}")]
    ProcessCrashed(CrashReason),

    #[error("Device channel lost: {0}")]
    ChannelLost(String),

    #[error("Process management error: {0}")]
    ProcessError(#[from] ProcessError),

    #[error("Profile error: {0}")]
    ProfileError(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RunnerError {
    pub fn unsupported(app: Option<&str>, bin: Option<&str>) -> Self {
        RunnerError::UnsupportedTarget {
            app: app.map(str::to_string),
            bin: bin.map(str::to_string),
        }
    }

    /// Surface a crash recorded by the monitor as the matching error kind
    pub fn from_crash(reason: CrashReason) -> Self {
        match reason {
            CrashReason::ChannelLost(message) => RunnerError::ChannelLost(message),
            other => RunnerError::ProcessCrashed(other),
        }
    }

    /// Errors raised before any runner or process exists
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            RunnerError::UnsupportedTarget { .. } | RunnerError::ConfigurationError(_)
        )
    }

    /// Errors that leave the runner in a terminal failure state
    pub fn is_runtime_failure(&self) -> bool {
        matches!(
            self,
            RunnerError::StartupTimeout(_)
                | RunnerError::ProcessCrashed(_)
                | RunnerError::ChannelLost(_)
        )
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(e: std::io::Error) -> Self {
        RunnerError::ProcessError(ProcessError::IoError(e))
    }
}

impl From<ChannelError> for RunnerError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Disconnected(message) => RunnerError::ChannelLost(message),
            other => RunnerError::DeviceError(other.to_string()),
        }
    }
}

/// Error types for process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Control channel lost: {0}")]
    ChannelLost(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl From<ChannelError> for ProcessError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Disconnected(message) => ProcessError::ChannelLost(message),
            ChannelError::Io(e) => ProcessError::IoError(e),
            other => ProcessError::Other(other.to_string()),
        }
    }
}

/// Failures of the remote device control channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Device disconnected: {0}")]
    Disconnected(String),
    #[error("Device command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Disconnected(_) | ChannelError::Io(_))
    }
}
