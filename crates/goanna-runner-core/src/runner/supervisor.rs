use super::monitor::MonitorHandle;
use super::{Runner, WaitOutcome};
use crate::backend::{Liveness, ProcessBackend};
use crate::config::RunnerConfig;
use crate::error::{ProcessError, RunnerError};
use crate::output::OutputBuffer;
use crate::process::{ProcessHandle, ProcessStatus, TerminationResult};
use crate::profile::ProfileContext;
use crate::state::{CrashReason, RunnerState, StateCell};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Everything owned by a single run, guarded by one lock so start, stop and
/// teardown never interleave.
#[derive(Default)]
struct Lifecycle {
    profile: Option<ProfileContext>,
    monitor: Option<MonitorHandle>,
    /// `prepare` ran and `teardown` has not yet
    cleanup_pending: bool,
}

/// Drives one process backend through the runner state machine.
///
/// The supervisor owns the profile, the process handle and the background
/// monitor. State changes are published through a [`StateCell`], so
/// `state()`, `is_running()` and `crashed()` never wait on a lifecycle call.
///
/// Teardown after the process ended on its own (a crash or a clean exit) is
/// done by the next `wait()`, `stop()` or `start()`.
pub struct Supervisor<B: ProcessBackend> {
    backend: Arc<B>,
    config: RunnerConfig,
    state: Arc<StateCell>,
    output: OutputBuffer,
    handle: Arc<Mutex<Option<B::Handle>>>,
    lifecycle: Mutex<Lifecycle>,
    ready_pattern: Option<Regex>,
}

impl<B: ProcessBackend> Supervisor<B> {
    pub fn new(backend: B, config: RunnerConfig) -> Result<Self, RunnerError> {
        config.validate()?;
        let signatures = config.compile_crash_signatures()?;
        let ready_pattern = config.compile_ready_pattern()?;
        Ok(Self {
            backend: Arc::new(backend),
            state: Arc::new(StateCell::new()),
            output: OutputBuffer::new(signatures),
            handle: Arc::new(Mutex::new(None)),
            lifecycle: Mutex::new(Lifecycle::default()),
            ready_pattern,
            config,
        })
    }

    /// Run the first start with an already acquired profile
    pub fn with_profile(mut self, profile: ProfileContext) -> Self {
        self.lifecycle.get_mut().profile = Some(profile);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Live view of the process output
    pub fn output_buffer(&self) -> &OutputBuffer {
        &self.output
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    fn label(&self) -> String {
        if self.config.name.is_empty() {
            self.backend.describe()
        } else {
            self.config.name.clone()
        }
    }

    async fn launch(&self, lifecycle: &mut Lifecycle) -> Result<B::Handle, RunnerError> {
        let profile = match lifecycle.profile.take() {
            Some(profile) if !profile.is_released() => profile,
            _ => ProfileContext::acquire(&self.config.profile)?,
        };
        let profile = lifecycle.profile.insert(profile);
        lifecycle.cleanup_pending = true;

        self.backend.prepare(profile).await?;
        let mut handle = self.backend.launch(profile, self.output.clone()).await?;

        let limit = self.config.timeouts.startup_timeout();
        let ready = tokio::time::timeout(limit, self.await_ready(&mut handle)).await;
        match ready {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                self.kill_partial(&mut handle).await;
                Err(e)
            }
            Err(_) => {
                warn!(runner = %self.label(), ?limit, "Process did not become responsive");
                self.kill_partial(&mut handle).await;
                Err(RunnerError::StartupTimeout(limit))
            }
        }
    }

    async fn await_ready(&self, handle: &mut B::Handle) -> Result<(), RunnerError> {
        let mut ticker = tokio::time::interval(self.config.timeouts.startup_probe_interval());
        loop {
            ticker.tick().await;

            if let Some(line) = self.output.crash_signature() {
                return Err(RunnerError::ProcessCrashed(CrashReason::Signature(line)));
            }

            match self.backend.probe(handle).await? {
                Liveness::Pending => {}
                Liveness::Exited(status) => {
                    self.state.record_exit(status.clone());
                    return Err(RunnerError::ProcessCrashed(CrashReason::UnexpectedExit(status)));
                }
                Liveness::Ready => match &self.ready_pattern {
                    None => return Ok(()),
                    Some(pattern) if self.output.any_line(|line| pattern.is_match(line)) => {
                        return Ok(());
                    }
                    Some(_) => {}
                },
            }
        }
    }

    async fn kill_partial(&self, handle: &mut B::Handle) {
        let result = self.backend.terminate(handle, false, Duration::ZERO).await;
        if !result.is_gone() {
            warn!(runner = %self.label(), ?result, "Failed to kill partially started process");
        }
    }

    /// Kill leftovers, undo `prepare` and release the profile
    async fn cleanup(&self, lifecycle: &mut Lifecycle) {
        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.halt().await;
        }

        let leftover = self.handle.lock().await.take();
        if let Some(mut handle) = leftover {
            match handle.try_wait().await {
                Ok(Some(status)) => {
                    debug!(%status, "Process already gone");
                    self.backend.reaped(&mut handle).await;
                }
                _ => {
                    let result = self.backend.terminate(&mut handle, false, Duration::ZERO).await;
                    if !result.is_gone() {
                        warn!(runner = %self.label(), ?result, "Failed to kill leftover process");
                    }
                    if self.state.last_exit().is_none() {
                        self.state.record_exit(ProcessStatus::Terminated);
                    }
                }
            }
        }

        if !lifecycle.cleanup_pending {
            return;
        }
        lifecycle.cleanup_pending = false;

        if let Err(e) = self.backend.teardown(lifecycle.profile.as_ref()).await {
            warn!(runner = %self.label(), error = %e, "Teardown failed");
        }
        if let Some(mut profile) = lifecycle.profile.take() {
            profile.release();
        }
    }

    /// Clean up after a process that ended on its own
    async fn reap(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state.get().is_terminal() {
            self.cleanup(&mut lifecycle).await;
        }
    }
}

#[async_trait]
impl<B: ProcessBackend> Runner for Supervisor<B> {
    async fn start(&self) -> Result<(), RunnerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        match self
            .state
            .transition(&[RunnerState::NotStarted, RunnerState::Stopped], RunnerState::Starting)
        {
            Ok(_) => {}
            Err(state) if state.is_live() => return Err(RunnerError::AlreadyRunning),
            Err(state) => {
                return Err(RunnerError::InvalidTransition {
                    operation: "start",
                    state,
                });
            }
        }

        // a previous run that exited by itself may not have been reaped
        self.cleanup(&mut lifecycle).await;
        self.state.reset_crash();
        self.output.clear();
        info!(runner = %self.label(), "Starting");

        match self.launch(&mut lifecycle).await {
            Ok(handle) => {
                *self.handle.lock().await = Some(handle);
                if let Err(state) = self
                    .state
                    .transition(&[RunnerState::Starting], RunnerState::Running)
                {
                    return Err(RunnerError::InvalidTransition {
                        operation: "start",
                        state,
                    });
                }
                lifecycle.monitor = Some(MonitorHandle::spawn(
                    self.handle.clone(),
                    self.state.clone(),
                    self.output.clone(),
                    self.config.timeouts.monitor_interval(),
                ));
                info!(runner = %self.label(), "Running");
                Ok(())
            }
            Err(e) => {
                error!(runner = %self.label(), error = %e, "Start failed");
                let reason = match &e {
                    RunnerError::ProcessCrashed(reason) => reason.clone(),
                    other => CrashReason::StartupFailed(other.to_string()),
                };
                self.state.mark_crashed(&[RunnerState::Starting], reason);
                // the caller gets this error now, not on the next call
                self.state.mark_crash_reported();
                self.cleanup(&mut lifecycle).await;
                Err(e)
            }
        }
    }

    async fn stop(&self, graceful: bool) -> Result<(), RunnerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        loop {
            match self.state.get() {
                RunnerState::NotStarted => return Ok(()),
                RunnerState::Stopped => {
                    self.cleanup(&mut lifecycle).await;
                    return Ok(());
                }
                RunnerState::Crashed => {
                    self.cleanup(&mut lifecycle).await;
                    let _ = self.state.transition(&[RunnerState::Crashed], RunnerState::Stopped);
                    return match self.state.take_unreported_crash() {
                        Some(reason) => Err(RunnerError::from_crash(reason)),
                        None => Ok(()),
                    };
                }
                RunnerState::Stopping => {
                    return Err(RunnerError::InvalidTransition {
                        operation: "stop",
                        state: RunnerState::Stopping,
                    });
                }
                RunnerState::Starting | RunnerState::Running => {
                    // the monitor may crash the runner between the read and the swap
                    if self
                        .state
                        .transition(
                            &[RunnerState::Starting, RunnerState::Running],
                            RunnerState::Stopping,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }

        info!(runner = %self.label(), graceful, "Stopping");
        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.halt().await;
        }

        let taken = self.handle.lock().await.take();
        let result = match taken {
            Some(mut handle) => {
                let grace = self.config.timeouts.grace_period();
                let result = self.backend.terminate(&mut handle, graceful, grace).await;
                let status = match handle.try_wait().await {
                    Ok(Some(status)) => status,
                    _ => ProcessStatus::Terminated,
                };
                debug!(%status, ?result, "Process terminated");
                self.state.record_exit(status);
                result
            }
            None => TerminationResult::ProcessNotFound,
        };

        self.cleanup(&mut lifecycle).await;
        let _ = self.state.transition(&[RunnerState::Stopping], RunnerState::Stopped);
        info!(runner = %self.label(), "Stopped");

        match result {
            TerminationResult::Success | TerminationResult::ProcessNotFound => Ok(()),
            TerminationResult::Timeout => Err(ProcessError::Timeout.into()),
            TerminationResult::PermissionDenied => {
                Err(ProcessError::PermissionDenied(self.label()).into())
            }
            TerminationResult::Failed(message) => Err(ProcessError::Other(message).into()),
        }
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, RunnerError> {
        let state = self.state.get();
        if state == RunnerState::NotStarted {
            return Err(RunnerError::InvalidTransition {
                operation: "wait",
                state,
            });
        }

        let mut rx = self.state.subscribe();
        let finished = async move { rx.wait_for(|s| s.is_terminal()).await.map(|s| *s) };
        let finished = match timeout {
            Some(limit) => match tokio::time::timeout(limit, finished).await {
                Ok(finished) => finished,
                Err(_) => return Ok(WaitOutcome::TimedOut),
            },
            None => finished.await,
        };
        let state = finished.map_err(|e| anyhow::anyhow!("State channel closed: {e}"))?;
        debug!(runner = %self.label(), %state, "Wait finished");

        self.reap().await;

        match self.state.take_unreported_crash() {
            Some(reason) => Err(RunnerError::from_crash(reason)),
            None => Ok(WaitOutcome::Exited(
                self.state.last_exit().unwrap_or(ProcessStatus::Unknown),
            )),
        }
    }

    fn is_running(&self) -> bool {
        self.state.get() == RunnerState::Running
    }

    fn state(&self) -> RunnerState {
        self.state.get()
    }

    fn output(&self) -> Vec<String> {
        self.output.lines()
    }

    fn crashed(&self) -> bool {
        self.state.crashed()
    }

    fn crash_reason(&self) -> Option<CrashReason> {
        self.state.crash_reason()
    }
}

impl<B: ProcessBackend> Drop for Supervisor<B> {
    fn drop(&mut self) {
        if let Some(monitor) = self.lifecycle.get_mut().monitor.as_ref() {
            monitor.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::process::ProcessId;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeProcess {
        exit: StdMutex<Option<ProcessStatus>>,
        lost: StdMutex<bool>,
    }

    impl FakeProcess {
        fn exit_with(&self, status: ProcessStatus) {
            *self.exit.lock().unwrap() = Some(status);
        }

        fn lose_channel(&self) {
            *self.lost.lock().unwrap() = true;
        }
    }

    struct FakeHandle {
        process: Arc<FakeProcess>,
        args: Vec<String>,
        started_at: Instant,
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            Some(ProcessId(1234))
        }

        fn get_command(&self) -> &str {
            "fake-browser"
        }

        fn get_args(&self) -> &[String] {
            &self.args
        }

        fn started_at(&self) -> Instant {
            self.started_at
        }

        async fn is_running(&self) -> bool {
            self.process.exit.lock().unwrap().is_none()
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>, ProcessError> {
            if *self.process.lost.lock().unwrap() {
                return Err(ProcessError::ChannelLost("fake device unplugged".to_string()));
            }
            Ok(self.process.exit.lock().unwrap().clone())
        }

        async fn wait(&mut self) -> Result<ProcessStatus, ProcessError> {
            loop {
                if let Some(status) = self.try_wait().await? {
                    return Ok(status);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn kill(&mut self) -> Result<(), ProcessError> {
            self.process.exit_with(ProcessStatus::Terminated);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        process: Arc<FakeProcess>,
        calls: StdMutex<Vec<String>>,
        never_ready: bool,
        banner: Option<&'static str>,
    }

    impl FakeBackend {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == call).count()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl ProcessBackend for FakeBackend {
        type Handle = FakeHandle;

        fn describe(&self) -> String {
            "fake".to_string()
        }

        async fn prepare(&self, _profile: &ProfileContext) -> Result<(), RunnerError> {
            self.record("prepare");
            Ok(())
        }

        async fn launch(
            &self,
            profile: &ProfileContext,
            output: OutputBuffer,
        ) -> Result<FakeHandle, RunnerError> {
            self.record("launch");
            *self.process.exit.lock().unwrap() = None;
            if let Some(banner) = self.banner {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    output.push_line(banner);
                });
            }
            Ok(FakeHandle {
                process: self.process.clone(),
                args: vec!["-profile".to_string(), profile.path().display().to_string()],
                started_at: Instant::now(),
            })
        }

        async fn probe(&self, handle: &mut FakeHandle) -> Result<Liveness, RunnerError> {
            if self.never_ready {
                return Ok(Liveness::Pending);
            }
            match handle.try_wait().await? {
                Some(status) => Ok(Liveness::Exited(status)),
                None => Ok(Liveness::Ready),
            }
        }

        async fn terminate(
            &self,
            handle: &mut FakeHandle,
            graceful: bool,
            _grace: Duration,
        ) -> TerminationResult {
            self.record(if graceful { "terminate_graceful" } else { "terminate_forced" });
            if handle.process.exit.lock().unwrap().is_some() {
                return TerminationResult::ProcessNotFound;
            }
            handle.process.exit_with(ProcessStatus::Terminated);
            TerminationResult::Success
        }

        async fn teardown(&self, profile: Option<&ProfileContext>) -> Result<(), RunnerError> {
            assert!(profile.is_some_and(|p| !p.is_released()));
            self.record("teardown");
            Ok(())
        }
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig::builder()
            .name("fake")
            .timeouts(TimeoutConfig {
                startup_timeout_ms: 300,
                startup_probe_interval_ms: 10,
                grace_period_ms: 100,
                monitor_interval_ms: 10,
            })
            .build()
            .unwrap()
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn supervisor(backend: FakeBackend) -> Supervisor<FakeBackend> {
        init_tracing();
        Supervisor::new(backend, fast_config()).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let runner = supervisor(FakeBackend::default());
        assert_eq!(runner.state(), RunnerState::NotStarted);
        assert!(!runner.is_running());

        runner.start().await.unwrap();
        assert_eq!(runner.state(), RunnerState::Running);
        assert!(runner.is_running());

        runner.stop(true).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(!runner.is_running());
        assert!(!runner.crashed());
        assert_eq!(
            runner.backend().calls(),
            vec!["prepare", "launch", "terminate_graceful", "teardown"]
        );
    }

    #[tokio::test]
    async fn test_fresh_profile_removed_after_stop() {
        let profile = ProfileContext::acquire(&Default::default()).unwrap();
        let path = profile.path().to_path_buf();
        let runner = supervisor(FakeBackend::default()).with_profile(profile);

        runner.start().await.unwrap();
        assert!(path.is_dir());
        runner.stop(true).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_start_while_running_fails() {
        let runner = supervisor(FakeBackend::default());
        runner.start().await.unwrap();

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyRunning));
        assert_eq!(runner.backend().count("launch"), 1);

        runner.stop(false).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_starts_launch_once() {
        let runner = Arc::new(supervisor(FakeBackend::default()));
        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start().await }
        });
        let second = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start().await }
        });

        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(RunnerError::AlreadyRunning)))
        );
        assert_eq!(runner.backend().count("launch"), 1);
        assert_eq!(runner.state(), RunnerState::Running);

        runner.stop(true).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_start_waits_then_stops() {
        let backend = FakeBackend {
            banner: Some("Listening on port 2828"),
            ..Default::default()
        };
        let process = backend.process.clone();
        let mut config = fast_config();
        config.ready_pattern = Some("Listening".to_string());
        let runner = Arc::new(Supervisor::new(backend, config).unwrap());

        let starting = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start().await }
        });
        let mut rx = runner.subscribe();
        rx.wait_for(|s| *s == RunnerState::Starting).await.unwrap();

        runner.stop(true).await.unwrap();
        starting.await.unwrap().unwrap();

        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(!runner.crashed());
        assert!(process.exit.lock().unwrap().is_some());
        assert_eq!(
            runner.backend().calls(),
            vec!["prepare", "launch", "terminate_graceful", "teardown"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_hung_start_leaves_nothing_running() {
        let backend = FakeBackend {
            never_ready: true,
            ..Default::default()
        };
        let process = backend.process.clone();
        let runner = Arc::new(supervisor(backend));

        let starting = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start().await }
        });
        let mut rx = runner.subscribe();
        rx.wait_for(|s| *s == RunnerState::Starting).await.unwrap();

        // the timeout is reported by start(), not again by stop()
        runner.stop(true).await.unwrap();
        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, RunnerError::StartupTimeout(_)));

        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(process.exit.lock().unwrap().is_some());
        assert_eq!(runner.backend().count("launch"), 1);
        assert_eq!(runner.backend().count("teardown"), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let runner = supervisor(FakeBackend::default());
        runner.stop(true).await.unwrap();
        assert_eq!(runner.state(), RunnerState::NotStarted);

        runner.start().await.unwrap();
        runner.stop(true).await.unwrap();
        runner.stop(true).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(runner.backend().count("terminate_graceful"), 1);
        assert_eq!(runner.backend().count("teardown"), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let runner = supervisor(FakeBackend::default());
        runner.start().await.unwrap();
        runner.stop(true).await.unwrap();

        runner.start().await.unwrap();
        assert!(runner.is_running());
        assert_eq!(runner.backend().count("launch"), 2);
        runner.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_timeout_kills_process() {
        let backend = FakeBackend {
            never_ready: true,
            ..Default::default()
        };
        let runner = supervisor(backend);

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::StartupTimeout(_)));
        assert_eq!(runner.state(), RunnerState::Crashed);
        assert!(runner.crashed());
        assert_eq!(runner.backend().count("terminate_forced"), 1);
        assert_eq!(runner.backend().count("teardown"), 1);

        // the timeout was already reported by start()
        runner.stop(true).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(runner.backend().count("teardown"), 1);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_a_crash() {
        let backend = FakeBackend::default();
        let process = backend.process.clone();
        let runner = supervisor(backend);
        runner.start().await.unwrap();

        process.exit_with(ProcessStatus::Terminated);
        let err = runner.wait(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::ProcessCrashed(CrashReason::UnexpectedExit(ProcessStatus::Terminated))
        ));
        assert_eq!(runner.state(), RunnerState::Crashed);
        assert!(!runner.is_running());
        // teardown runs even though nobody asked for a stop
        assert_eq!(runner.backend().count("teardown"), 1);

        runner.stop(true).await.unwrap();
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(runner.crashed());
        assert_eq!(runner.backend().count("terminate_graceful"), 0);
    }

    #[tokio::test]
    async fn test_crash_signature_detected() {
        let runner = supervisor(FakeBackend::default());
        runner.start().await.unwrap();

        runner
            .output_buffer()
            .push_line("###!!! ABORT: file nsTArray.cpp, line 82");
        let err = runner.wait(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::ProcessCrashed(CrashReason::Signature(ref line)) if line.contains("ABORT")
        ));
        // the still running process was killed during cleanup
        assert_eq!(runner.backend().count("terminate_forced"), 1);
        assert!(runner.output().iter().any(|l| l.contains("nsTArray")));
    }

    #[tokio::test]
    async fn test_crash_surfaces_on_stop_when_not_waited() {
        let backend = FakeBackend::default();
        let process = backend.process.clone();
        let runner = supervisor(backend);
        runner.start().await.unwrap();

        process.exit_with(ProcessStatus::Failed("SIGSEGV".to_string()));
        let mut rx = runner.subscribe();
        rx.wait_for(|s| *s == RunnerState::Crashed).await.unwrap();

        let err = runner.stop(true).await.unwrap_err();
        assert!(matches!(err, RunnerError::ProcessCrashed(_)));
        assert_eq!(runner.state(), RunnerState::Stopped);
        // reported once
        runner.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_loss_is_distinct() {
        let backend = FakeBackend::default();
        let process = backend.process.clone();
        let runner = supervisor(backend);
        runner.start().await.unwrap();

        process.lose_channel();
        let err = runner.wait(None).await.unwrap_err();
        assert!(matches!(err, RunnerError::ChannelLost(_)));
        assert!(matches!(runner.crash_reason(), Some(CrashReason::ChannelLost(_))));
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_state_alone() {
        let runner = supervisor(FakeBackend::default());
        runner.start().await.unwrap();

        let outcome = runner.wait(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(runner.state(), RunnerState::Running);

        runner.stop(true).await.unwrap();
        let outcome = runner.wait(None).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Exited(ProcessStatus::Terminated));
    }

    #[tokio::test]
    async fn test_wait_before_start_is_rejected() {
        let runner = supervisor(FakeBackend::default());
        let err = runner.wait(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::InvalidTransition {
                operation: "wait",
                state: RunnerState::NotStarted
            }
        ));
    }

    #[tokio::test]
    async fn test_ready_pattern_gates_startup() {
        let backend = FakeBackend {
            banner: Some("Marionette INFO Listening on port 2828"),
            ..Default::default()
        };
        let mut config = fast_config();
        config.ready_pattern = Some(r"Listening on port \d+".to_string());
        let runner = Supervisor::new(backend, config).unwrap();

        runner.start().await.unwrap();
        assert!(runner.output().iter().any(|l| l.contains("2828")));
        runner.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_ready_line_times_out() {
        let mut config = fast_config();
        config.ready_pattern = Some("never printed".to_string());
        let runner = Supervisor::new(FakeBackend::default(), config).unwrap();

        let err = runner.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::StartupTimeout(_)));
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected_at_construction() {
        let mut config = fast_config();
        config.crash_signatures = vec!["(unclosed".to_string()];
        let result = Supervisor::new(FakeBackend::default(), config);
        assert!(matches!(result, Err(RunnerError::ConfigurationError(_))));
    }

    #[test]
    fn test_degenerate_timeouts_rejected_at_construction() {
        let mut config = fast_config();
        config.timeouts.startup_probe_interval_ms = 0;
        let result = Supervisor::new(FakeBackend::default(), config);
        assert!(matches!(result, Err(RunnerError::ConfigurationError(_))));

        let mut config = fast_config();
        config.timeouts.monitor_interval_ms = 0;
        let result = Supervisor::new(FakeBackend::default(), config);
        assert!(matches!(result, Err(RunnerError::ConfigurationError(_))));

        let mut config = fast_config();
        config.timeouts.grace_period_ms = u64::MAX;
        let result = Supervisor::new(FakeBackend::default(), config);
        assert!(matches!(result, Err(RunnerError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_is_running_does_not_block_during_start() {
        let backend = FakeBackend {
            never_ready: true,
            ..Default::default()
        };
        let runner = Arc::new(supervisor(backend));
        let starting = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.start().await })
        };

        let mut rx = runner.subscribe();
        rx.wait_for(|s| *s == RunnerState::Starting).await.unwrap();
        assert!(!runner.is_running());
        assert_eq!(runner.state(), RunnerState::Starting);

        assert!(starting.await.unwrap().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_is_not_a_crash() {
        use std::os::unix::process::ExitStatusExt;

        let backend = FakeBackend::default();
        let process = backend.process.clone();
        let runner = supervisor(backend);
        runner.start().await.unwrap();

        let status = ProcessStatus::Exited(std::process::ExitStatus::from_raw(0));
        process.exit_with(status.clone());
        let outcome = runner.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Exited(status));
        assert_eq!(runner.state(), RunnerState::Stopped);
        assert!(!runner.crashed());
        assert_eq!(runner.backend().count("teardown"), 1);
    }
}
