use crate::error::ProcessError;
use crate::output::OutputBuffer;
use crate::process::{ProcessHandle, ProcessStatus};
use crate::state::{CrashReason, RunnerState, StateCell};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive probe errors tolerated before the process counts as crashed
const MAX_PROBE_FAILURES: u32 = 3;

pub(crate) struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn spawn<H: ProcessHandle + 'static>(
        handle: Arc<Mutex<Option<H>>>,
        state: Arc<StateCell>,
        output: OutputBuffer,
        interval: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(supervise(handle, state, output, interval, token.clone()));
        Self { token, task }
    }

    /// Stop watching and wait for the task to finish its current probe
    pub(crate) async fn halt(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

enum Probe {
    Alive,
    Exited(ProcessStatus),
    Lost(String),
    Failed(String),
    Released,
}

async fn probe<H: ProcessHandle>(handle: &Mutex<Option<H>>) -> Probe {
    let mut slot = handle.lock().await;
    let Some(process) = slot.as_mut() else {
        return Probe::Released;
    };
    match process.try_wait().await {
        Ok(None) => Probe::Alive,
        Ok(Some(status)) => Probe::Exited(status),
        Err(ProcessError::ChannelLost(message)) => Probe::Lost(message),
        Err(e) => Probe::Failed(e.to_string()),
    }
}

/// Background watcher for one live process.
///
/// Runs until cancelled or until it has moved the runner out of a live state.
async fn supervise<H: ProcessHandle>(
    handle: Arc<Mutex<Option<H>>>,
    state: Arc<StateCell>,
    output: OutputBuffer,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0;

    let reason = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Monitor cancelled");
                return;
            }
            line = output.crash_detected() => break CrashReason::Signature(line),
            _ = ticker.tick() => match probe(&handle).await {
                Probe::Alive => failures = 0,
                Probe::Released => return,
                Probe::Exited(status) if status.is_clean_exit() => {
                    state.record_exit(status.clone());
                    if state.transition(&[RunnerState::Running], RunnerState::Stopped).is_ok() {
                        info!(%status, "Process exited cleanly");
                    }
                    return;
                }
                Probe::Exited(status) => {
                    state.record_exit(status.clone());
                    break CrashReason::UnexpectedExit(status);
                }
                Probe::Lost(message) => break CrashReason::ChannelLost(message),
                Probe::Failed(message) => {
                    failures += 1;
                    warn!(%message, failures, "Liveness probe failed");
                    if failures >= MAX_PROBE_FAILURES {
                        break CrashReason::MonitorFailed(message);
                    }
                }
            },
        }
    };

    if state.mark_crashed(&[RunnerState::Starting, RunnerState::Running], reason.clone()) {
        error!(%reason, "Runner crashed");
    }
}
