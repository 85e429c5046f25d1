#![allow(dead_code)]

use async_trait::async_trait;
use goanna_runner::{ChannelError, DeviceChannel, LaunchIntent, LogStream, RunnerConfig, TimeoutConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const PACKAGE: &str = "org.mozilla.fennec";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_file(true)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

/// Config with timeouts short enough for tests
pub fn fast_config() -> RunnerConfig {
    RunnerConfig::builder()
        .timeouts(TimeoutConfig {
            startup_timeout_ms: 2_000,
            startup_probe_interval_ms: 10,
            grace_period_ms: 1_000,
            monitor_interval_ms: 20,
        })
        .build()
        .unwrap()
}

pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Default)]
pub struct MockState {
    pub disconnected: bool,
    pub installed: HashSet<String>,
    pub running: Option<u32>,
    pub next_pid: u32,
    pub remote_files: HashSet<String>,
    pub launched: Vec<LaunchIntent>,
    pub calls: Vec<String>,
    /// Launch succeeds but no process ever shows up
    pub launch_without_process: bool,
    pub ignore_sigterm: bool,
    pub fail_uninstall: bool,
    log_tx: Option<mpsc::Sender<Result<String, ChannelError>>>,
}

/// In-memory device with one browser package
#[derive(Default)]
pub struct MockDeviceChannel {
    state: Mutex<MockState>,
}

impl MockDeviceChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_installed(package: &str) -> Arc<Self> {
        let channel = Self::default();
        channel.state().installed.insert(package.to_string());
        Arc::new(channel)
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == call).count()
    }

    pub fn is_installed_now(&self, package: &str) -> bool {
        self.state().installed.contains(package)
    }

    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    /// The app dies on the device
    pub fn kill_app(&self) {
        self.state().running = None;
    }

    pub fn emit_log(&self, line: &str) {
        if let Some(tx) = &self.state().log_tx {
            let _ = tx.try_send(Ok(line.to_string()));
        }
    }

    fn call(&self, name: &str) -> Result<std::sync::MutexGuard<'_, MockState>, ChannelError> {
        let mut state = self.state();
        state.calls.push(name.to_string());
        if state.disconnected {
            return Err(ChannelError::Disconnected("error: device offline".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl DeviceChannel for MockDeviceChannel {
    fn serial(&self) -> Option<&str> {
        Some("emulator-5554")
    }

    async fn ping(&self) -> Result<(), ChannelError> {
        self.call("ping").map(|_| ())
    }

    async fn is_installed(&self, package: &str) -> Result<bool, ChannelError> {
        Ok(self.call("is_installed")?.installed.contains(package))
    }

    async fn install(&self, _archive: &Path) -> Result<(), ChannelError> {
        self.call("install")?.installed.insert(PACKAGE.to_string());
        Ok(())
    }

    async fn uninstall(&self, package: &str) -> Result<(), ChannelError> {
        let mut state = self.call("uninstall")?;
        if state.fail_uninstall || !state.installed.remove(package) {
            return Err(ChannelError::CommandFailed {
                command: "uninstall".to_string(),
                message: "Failure [DELETE_FAILED_INTERNAL_ERROR]".to_string(),
            });
        }
        Ok(())
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        let mut state = self.call("push")?;
        if !local.exists() {
            return Err(ChannelError::CommandFailed {
                command: "push".to_string(),
                message: format!("{}: No such file or directory", local.display()),
            });
        }
        state.remote_files.insert(remote.to_string());
        Ok(())
    }

    async fn remove(&self, remote: &str) -> Result<(), ChannelError> {
        self.call("remove")?.remote_files.remove(remote);
        Ok(())
    }

    async fn launch(&self, intent: &LaunchIntent) -> Result<(), ChannelError> {
        let mut state = self.call("launch")?;
        if !state.installed.contains(&intent.package) {
            return Err(ChannelError::CommandFailed {
                command: "am start".to_string(),
                message: "Error: Activity class does not exist.".to_string(),
            });
        }
        state.launched.push(intent.clone());
        if !state.launch_without_process {
            state.next_pid += 1;
            state.running = Some(4000 + state.next_pid);
        }
        Ok(())
    }

    async fn pid_of(&self, _package: &str) -> Result<Option<u32>, ChannelError> {
        Ok(self.call("pid_of")?.running)
    }

    async fn signal(&self, pid: u32, _signal: i32) -> Result<(), ChannelError> {
        let mut state = self.call("signal")?;
        if !state.ignore_sigterm && state.running == Some(pid) {
            state.running = None;
        }
        Ok(())
    }

    async fn force_stop(&self, _package: &str) -> Result<(), ChannelError> {
        self.call("force_stop")?.running = None;
        Ok(())
    }

    async fn clear_log(&self) -> Result<(), ChannelError> {
        self.call("clear_log").map(|_| ())
    }

    async fn log_stream(&self) -> Result<LogStream, ChannelError> {
        let mut state = self.call("log_stream")?;
        let (tx, rx) = mpsc::channel(64);
        state.log_tx = Some(tx);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

pub fn archive_path() -> PathBuf {
    PathBuf::from("/builds/fennec-52.0.multi.android-arm.apk")
}
