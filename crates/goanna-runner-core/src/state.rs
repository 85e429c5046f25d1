//! Lifecycle states of a runner and the shared cell the supervisor and the
//! background monitor use to publish them.

use crate::process::ProcessStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl RunnerState {
    /// A process exists or is being brought up
    pub fn is_live(self) -> bool {
        matches!(self, RunnerState::Starting | RunnerState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Crashed)
    }

    pub fn can_transition_to(self, next: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, next),
            (NotStarted | Stopped, Starting)
                | (Starting, Running | Stopping | Crashed)
                | (Running, Stopping | Stopped | Crashed)
                | (Stopping, Stopped)
                // teardown after a crash
                | (Crashed, Stopped)
        )
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::NotStarted => "NOT_STARTED",
            RunnerState::Starting => "STARTING",
            RunnerState::Running => "RUNNING",
            RunnerState::Stopping => "STOPPING",
            RunnerState::Stopped => "STOPPED",
            RunnerState::Crashed => "CRASHED",
        };
        f.write_str(name)
    }
}

/// Why a runner ended up crashed
#[derive(Debug, Clone, PartialEq)]
pub enum CrashReason {
    /// The process went away without being asked to
    UnexpectedExit(ProcessStatus),
    /// A crash signature showed up in the process output
    Signature(String),
    /// The device control channel dropped
    ChannelLost(String),
    /// Launch or startup probing failed
    StartupFailed(String),
    /// Liveness probing kept failing
    MonitorFailed(String),
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashReason::UnexpectedExit(status) => write!(f, "unexpected exit: {status}"),
            CrashReason::Signature(line) => write!(f, "crash signature in output: {line}"),
            CrashReason::ChannelLost(message) => write!(f, "control channel lost: {message}"),
            CrashReason::StartupFailed(message) => write!(f, "startup failed: {message}"),
            CrashReason::MonitorFailed(message) => write!(f, "liveness probe failed: {message}"),
        }
    }
}

/// Thread-safe state shared between a runner and its monitor task.
///
/// Every transition is a compare-and-set against an allowed set of source
/// states, so a crash reported by the monitor and a caller-issued `stop()`
/// can never both win.
pub struct StateCell {
    tx: watch::Sender<RunnerState>,
    crashed: AtomicBool,
    crash_reported: AtomicBool,
    crash: Mutex<Option<CrashReason>>,
    last_exit: Mutex<Option<ProcessStatus>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunnerState::NotStarted);
        Self {
            tx,
            crashed: AtomicBool::new(false),
            crash_reported: AtomicBool::new(false),
            crash: Mutex::new(None),
            last_exit: Mutex::new(None),
        }
    }

    pub fn get(&self) -> RunnerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the current state is one of `from`.
    ///
    /// Returns the previous state on success and the observed state on failure.
    pub fn transition(
        &self,
        from: &[RunnerState],
        next: RunnerState,
    ) -> Result<RunnerState, RunnerState> {
        let mut observed = RunnerState::NotStarted;
        let changed = self.tx.send_if_modified(|current| {
            observed = *current;
            if from.contains(current) && current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed { Ok(observed) } else { Err(observed) }
    }

    /// Record a crash and move to `Crashed` if the current state is one of `from`.
    pub fn mark_crashed(&self, from: &[RunnerState], reason: CrashReason) -> bool {
        self.tx.send_if_modified(|current| {
            if !from.contains(current) || !current.can_transition_to(RunnerState::Crashed) {
                return false;
            }
            // flag and reason become visible together with the state
            if let Ok(mut slot) = self.crash.lock() {
                *slot = Some(reason.clone());
            }
            self.crash_reported.store(false, Ordering::SeqCst);
            self.crashed.store(true, Ordering::SeqCst);
            *current = RunnerState::Crashed;
            true
        })
    }

    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn crash_reason(&self) -> Option<CrashReason> {
        self.crash.lock().ok().and_then(|slot| slot.clone())
    }

    /// Hand out the crash reason once; later calls see `None`
    pub fn take_unreported_crash(&self) -> Option<CrashReason> {
        if !self.crashed() || self.crash_reported.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.crash_reason()
    }

    pub fn mark_crash_reported(&self) {
        self.crash_reported.store(true, Ordering::SeqCst);
    }

    pub fn reset_crash(&self) {
        self.crashed.store(false, Ordering::SeqCst);
        self.crash_reported.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.crash.lock() {
            *slot = None;
        }
        if let Ok(mut exit) = self.last_exit.lock() {
            *exit = None;
        }
    }

    pub fn record_exit(&self, status: ProcessStatus) {
        if let Ok(mut exit) = self.last_exit.lock() {
            *exit = Some(status);
        }
    }

    pub fn last_exit(&self) -> Option<ProcessStatus> {
        self.last_exit.lock().ok().and_then(|exit| exit.clone())
    }
}
