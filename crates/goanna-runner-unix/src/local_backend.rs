use crate::{UnixProcessHandle, UnixProcessManager};
use async_trait::async_trait;
use goanna_runner_core::{
    LocalBackendFactory, OutputBuffer, ProcessBackend, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessTermination, ProfileContext, RunnerConfig, RunnerError, TerminationResult,
};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Environment every local browser starts with unless the caller overrides it
const DEFAULT_ENV: &[(&str, &str)] = &[
    ("MOZ_NO_REMOTE", "1"),
    ("MOZ_CRASHREPORTER", "1"),
    ("MOZ_CRASHREPORTER_NO_REPORT", "1"),
];

/// Launches a browser binary on this host.
///
/// Composes [`UnixProcessManager`] for the low-level work and keeps track of
/// the process groups it started so they can be killed if the runner is
/// dropped without being stopped.
pub struct UnixLocalBackend {
    platform_manager: Arc<UnixProcessManager>,
    binary: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    /// Process groups started by this backend and not yet terminated
    active_processes: Arc<Mutex<HashMap<ProcessId, String>>>,
}

impl UnixLocalBackend {
    pub fn new(binary: &Path, config: &RunnerConfig) -> Self {
        Self {
            platform_manager: Arc::new(UnixProcessManager::new()),
            binary: binary.to_path_buf(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_directory.clone(),
            active_processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Full argument list for a run with `profile`
    pub fn command_line(&self, profile: &Path) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "-profile".to_string(),
            profile.display().to_string(),
            "-no-remote".to_string(),
            "-foreground".to_string(),
        ]);
        args
    }

    /// Launch environment: defaults overlaid with the configured variables
    pub fn environment(&self) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = DEFAULT_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.extend(self.env.clone());
        env
    }

    pub fn active_process_count(&self) -> usize {
        self.active_processes.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn track(&self, pgid: ProcessId) {
        if let Ok(mut active) = self.active_processes.lock() {
            active.insert(pgid, self.binary.display().to_string());
        }
    }

    fn untrack(&self, pgid: ProcessId) {
        if let Ok(mut active) = self.active_processes.lock() {
            active.remove(&pgid);
        }
    }

    fn tracked(&self) -> Vec<ProcessId> {
        self.active_processes
            .lock()
            .map(|active| active.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProcessBackend for UnixLocalBackend {
    type Handle = UnixProcessHandle;

    fn describe(&self) -> String {
        format!("local:{}", self.binary.display())
    }

    async fn launch(
        &self,
        profile: &ProfileContext,
        output: OutputBuffer,
    ) -> Result<Self::Handle, RunnerError> {
        let command = self.binary.display().to_string();
        let args = self.command_line(profile.path());
        let handle = self
            .platform_manager
            .spawn_process(
                &command,
                &args,
                self.working_dir.as_deref(),
                &self.environment(),
                output,
            )
            .await
            .map_err(|e| RunnerError::Other(e.context(format!("Failed to launch {command}"))))?;

        if let Some(pgid) = handle.process_group() {
            self.track(pgid);
        }
        Ok(handle)
    }

    async fn terminate(
        &self,
        handle: &mut Self::Handle,
        graceful: bool,
        grace: Duration,
    ) -> TerminationResult {
        let result = if graceful {
            self.platform_manager
                .terminate_with_grace(handle, grace)
                .await
        } else {
            self.platform_manager.force_kill(handle).await
        };

        if let Some(pgid) = handle.process_group() {
            // the leader is gone; anything it left behind in its group is not
            if result.is_gone() {
                self.platform_manager.kill_group(pgid);
            }
            self.untrack(pgid);
        }
        result
    }

    async fn reaped(&self, handle: &mut Self::Handle) {
        if let Some(pgid) = handle.process_group() {
            // a group id is not reused while members remain, so this only hits our leftovers
            if self.platform_manager.kill_group(pgid) == TerminationResult::Success {
                info!(pid = pgid.0, "Killed processes left behind by exited browser");
            }
            self.untrack(pgid);
        }
    }

    async fn teardown(&self, _profile: Option<&ProfileContext>) -> Result<(), RunnerError> {
        // never signal the leader pid itself; it may already be reaped and reused
        for pgid in self.tracked() {
            match self.platform_manager.kill_group(pgid) {
                TerminationResult::Success => info!(pid = pgid.0, "Killed leftover process group"),
                TerminationResult::ProcessNotFound => {}
                other => warn!(pid = pgid.0, result = ?other, "Failed to kill leftover process group"),
            }
            self.untrack(pgid);
        }
        self.platform_manager
            .cleanup()
            .await
            .map_err(RunnerError::Other)
    }
}

impl Drop for UnixLocalBackend {
    fn drop(&mut self) {
        let active = self.tracked();
        if active.is_empty() {
            return;
        }

        warn!(
            count = active.len(),
            "Emergency cleanup: killing processes during drop"
        );
        for pgid in active {
            if let Err(e) = self.platform_manager.signal_group(pgid, Signal::SIGKILL) {
                error!(pid = pgid.0, error = %e, "Failed to send SIGKILL during drop");
            }
        }
    }
}

/// Factory for creating Unix local backends
pub struct UnixLocalBackendFactory;

impl LocalBackendFactory for UnixLocalBackendFactory {
    type Backend = UnixLocalBackend;

    fn create_backend(binary: &Path, config: &RunnerConfig) -> Self::Backend {
        UnixLocalBackend::new(binary, config)
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
