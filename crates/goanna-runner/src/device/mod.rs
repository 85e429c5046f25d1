//! Runners for browsers that live on an attached device and are driven
//! through a [`DeviceChannel`].

mod adb;

pub use adb::AdbChannel;

use async_trait::async_trait;
use goanna_runner_core::{
    DeviceChannel, DeviceOptions, LaunchIntent, Liveness, OutputBuffer, ProcessBackend,
    ProcessError, ProcessHandle, ProcessId, ProcessStatus, ProfileContext, RunnerConfig,
    RunnerError, Supervisor, TerminationResult,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SIGTERM: i32 = 15;

/// How often a graceful stop checks whether the app is gone
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A browser process on the device, identified by its package
pub struct DeviceProcessHandle {
    channel: Arc<dyn DeviceChannel>,
    package: String,
    args: Vec<String>,
    started_at: Instant,
    pid: Option<u32>,
    exited: Option<ProcessStatus>,
}

impl DeviceProcessHandle {
    pub fn new(channel: Arc<dyn DeviceChannel>, package: String, args: Vec<String>) -> Self {
        Self {
            channel,
            package,
            args,
            started_at: Instant::now(),
            pid: None,
            exited: None,
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    fn mark_exited(&mut self) -> ProcessStatus {
        self.exited.get_or_insert(ProcessStatus::Terminated).clone()
    }
}

#[async_trait]
impl ProcessHandle for DeviceProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        self.pid.map(ProcessId::from)
    }

    fn get_command(&self) -> &str {
        &self.package
    }

    fn get_args(&self) -> &[String] {
        &self.args
    }

    fn started_at(&self) -> Instant {
        self.started_at
    }

    async fn is_running(&self) -> bool {
        self.exited.is_none() && self.pid.is_some()
    }

    /// The app counts as exited once a pid was seen and is gone, or replaced
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>, ProcessError> {
        if let Some(status) = &self.exited {
            return Ok(Some(status.clone()));
        }
        match (self.channel.pid_of(&self.package).await?, self.pid) {
            (Some(pid), None) => {
                debug!(package = %self.package, pid, "Device process appeared");
                self.pid = Some(pid);
                Ok(None)
            }
            (Some(pid), Some(seen)) if pid == seen => Ok(None),
            (Some(pid), Some(seen)) => {
                warn!(package = %self.package, old = seen, new = pid, "Device process was replaced");
                Ok(Some(self.mark_exited()))
            }
            (None, Some(_)) => Ok(Some(self.mark_exited())),
            (None, None) => Ok(None),
        }
    }

    async fn wait(&mut self) -> Result<ProcessStatus, ProcessError> {
        loop {
            if let Some(status) = self.try_wait().await? {
                return Ok(status);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.channel.force_stop(&self.package).await?;
        self.mark_exited();
        Ok(())
    }
}

struct LogPump {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Launches an installed browser package on a device.
///
/// The profile is pushed to the device before each launch and removed again
/// on teardown; the device log is copied into the runner output while the
/// app runs.
pub struct DeviceBackend {
    channel: Arc<dyn DeviceChannel>,
    options: DeviceOptions,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    remote_profile: Mutex<Option<String>>,
    log_pump: Mutex<Option<LogPump>>,
}

impl DeviceBackend {
    pub fn new(channel: Arc<dyn DeviceChannel>, config: &RunnerConfig) -> Self {
        Self {
            channel,
            options: config.device.clone(),
            args: config.args.clone(),
            env: config.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            remote_profile: Mutex::new(None),
            log_pump: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &Arc<dyn DeviceChannel> {
        &self.channel
    }

    pub fn package(&self) -> &str {
        &self.options.package
    }

    /// Where `profile` lives on the device
    pub fn remote_profile_path(&self, profile: &ProfileContext) -> String {
        let name = profile
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "profile".to_string());
        format!(
            "{}/{}-{}",
            self.options.remote_root.trim_end_matches('/'),
            self.options.package,
            name
        )
    }

    pub fn launch_intent(&self, remote_profile: &str) -> LaunchIntent {
        let mut args = self.args.clone();
        args.extend(["-profile".to_string(), remote_profile.to_string()]);
        LaunchIntent {
            package: self.options.package.clone(),
            activity: self.options.activity.clone(),
            action: self.options.intent_action.clone(),
            url: self.options.url.clone(),
            args,
            env: self.env.clone(),
        }
    }

    async fn start_log_pump(&self, output: OutputBuffer) -> Result<(), RunnerError> {
        self.channel.clear_log().await?;
        let mut stream = self.channel.log_stream().await?;
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    line = stream.next() => match line {
                        Some(Ok(line)) => output.push_line(line),
                        Some(Err(e)) => {
                            warn!(error = %e, "Device log stream failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("Device log pump finished");
        });

        if let Ok(mut slot) = self.log_pump.lock() {
            if let Some(previous) = slot.replace(LogPump { token, task }) {
                previous.token.cancel();
            }
        }
        Ok(())
    }

    async fn stop_log_pump(&self) {
        let pump = self.log_pump.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pump) = pump {
            pump.token.cancel();
            let _ = pump.task.await;
        }
    }

    async fn wait_gone(&self, handle: &mut DeviceProcessHandle, grace: Duration) -> bool {
        let deadline = Instant::now().checked_add(grace);
        while deadline.is_none_or(|deadline| Instant::now() < deadline) {
            match handle.try_wait().await {
                Ok(Some(_)) => return true,
                Ok(None) => tokio::time::sleep(STOP_POLL_INTERVAL).await,
                Err(_) => return false,
            }
        }
        false
    }
}

#[async_trait]
impl ProcessBackend for DeviceBackend {
    type Handle = DeviceProcessHandle;

    fn describe(&self) -> String {
        match self.channel.serial() {
            Some(serial) => format!("device:{serial}/{}", self.options.package),
            None => format!("device/{}", self.options.package),
        }
    }

    async fn prepare(&self, profile: &ProfileContext) -> Result<(), RunnerError> {
        self.channel.ping().await?;
        if !self.channel.is_installed(&self.options.package).await? {
            return Err(RunnerError::DeviceError(format!(
                "Package {} is not installed",
                self.options.package
            )));
        }

        let remote = self.remote_profile_path(profile);
        self.channel.push(profile.path(), &remote).await?;
        debug!(%remote, "Pushed profile to device");
        if let Ok(mut slot) = self.remote_profile.lock() {
            *slot = Some(remote);
        }
        Ok(())
    }

    async fn launch(
        &self,
        profile: &ProfileContext,
        output: OutputBuffer,
    ) -> Result<Self::Handle, RunnerError> {
        let remote = self
            .remote_profile
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| self.remote_profile_path(profile));

        // a leftover instance would hold the profile lock
        self.channel.force_stop(&self.options.package).await?;
        self.start_log_pump(output).await?;

        let intent = self.launch_intent(&remote);
        self.channel.launch(&intent).await?;
        info!(component = %intent.component(), "Launched on device");

        Ok(DeviceProcessHandle::new(
            self.channel.clone(),
            self.options.package.clone(),
            intent.args,
        ))
    }

    async fn probe(&self, handle: &mut Self::Handle) -> Result<Liveness, RunnerError> {
        match handle.try_wait().await {
            Ok(Some(status)) => Ok(Liveness::Exited(status)),
            Ok(None) if handle.get_pid().is_some() => Ok(Liveness::Ready),
            Ok(None) => Ok(Liveness::Pending),
            Err(ProcessError::ChannelLost(message)) => Err(RunnerError::ChannelLost(message)),
            Err(e) => Err(e.into()),
        }
    }

    async fn terminate(
        &self,
        handle: &mut Self::Handle,
        graceful: bool,
        grace: Duration,
    ) -> TerminationResult {
        if handle.exited.is_some() {
            return TerminationResult::ProcessNotFound;
        }

        if graceful {
            if let Some(pid) = handle.pid {
                match self.channel.signal(pid, SIGTERM).await {
                    Ok(()) if self.wait_gone(handle, grace).await => {
                        return TerminationResult::Success;
                    }
                    Ok(()) => warn!(pid, ?grace, "App ignored SIGTERM, force stopping"),
                    Err(e) => warn!(pid, error = %e, "Failed to signal app, force stopping"),
                }
            }
        }

        match handle.kill().await {
            Ok(()) => TerminationResult::Success,
            Err(e) => TerminationResult::Failed(e.to_string()),
        }
    }

    async fn teardown(&self, _profile: Option<&ProfileContext>) -> Result<(), RunnerError> {
        self.stop_log_pump().await;
        let remote = self.remote_profile.lock().ok().and_then(|mut slot| slot.take());
        if let Some(remote) = remote {
            self.channel.remove(&remote).await?;
            debug!(%remote, "Removed profile from device");
        }
        Ok(())
    }
}

/// Runs an installed browser package on a device
pub struct DeviceRunner {
    inner: Supervisor<DeviceBackend>,
}

impl DeviceRunner {
    pub fn new(channel: Arc<dyn DeviceChannel>, config: RunnerConfig) -> Result<Self, RunnerError> {
        let backend = DeviceBackend::new(channel, &config);
        Ok(Self {
            inner: Supervisor::new(backend, config)?,
        })
    }

    /// Open an adb channel from the device options in `config`
    pub fn adb(config: RunnerConfig) -> Result<Self, RunnerError> {
        let channel = AdbChannel::new(&config.device, config.retry_config.clone());
        Self::new(Arc::new(channel), config)
    }

    pub fn with_profile(self, profile: ProfileContext) -> Self {
        Self {
            inner: self.inner.with_profile(profile),
        }
    }

    pub fn supervisor(&self) -> &Supervisor<DeviceBackend> {
        &self.inner
    }
}

crate::delegate_runner!(DeviceRunner);
