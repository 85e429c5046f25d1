use crate::device::DeviceRunner;
use crate::local::LocalProcessRunner;
use crate::mobile::MobileAppRunner;
use crate::registry::RunnerKind;
use async_trait::async_trait;
use goanna_runner_core::{CrashReason, Runner, RunnerError, RunnerState, WaitOutcome};
use std::fmt;
use std::time::Duration;

/// A runner produced by [`InstanceFactory`](crate::InstanceFactory)
pub enum GoannaInstance {
    Local(LocalProcessRunner),
    Device(DeviceRunner),
    MobileApp(MobileAppRunner),
}

impl GoannaInstance {
    pub fn kind(&self) -> RunnerKind {
        match self {
            GoannaInstance::Local(_) => RunnerKind::LocalProcess,
            GoannaInstance::Device(_) => RunnerKind::Device,
            GoannaInstance::MobileApp(_) => RunnerKind::MobileApp,
        }
    }

    pub fn as_runner(&self) -> &dyn Runner {
        match self {
            GoannaInstance::Local(runner) => runner,
            GoannaInstance::Device(runner) => runner,
            GoannaInstance::MobileApp(runner) => runner,
        }
    }

    pub fn as_local(&self) -> Option<&LocalProcessRunner> {
        match self {
            GoannaInstance::Local(runner) => Some(runner),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<&DeviceRunner> {
        match self {
            GoannaInstance::Device(runner) => Some(runner),
            _ => None,
        }
    }

    pub fn as_mobile_app(&self) -> Option<&MobileAppRunner> {
        match self {
            GoannaInstance::MobileApp(runner) => Some(runner),
            _ => None,
        }
    }
}

impl fmt::Debug for GoannaInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoannaInstance")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Runner for GoannaInstance {
    async fn start(&self) -> Result<(), RunnerError> {
        self.as_runner().start().await
    }

    async fn stop(&self, graceful: bool) -> Result<(), RunnerError> {
        self.as_runner().stop(graceful).await
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<WaitOutcome, RunnerError> {
        self.as_runner().wait(timeout).await
    }

    fn is_running(&self) -> bool {
        self.as_runner().is_running()
    }

    fn state(&self) -> RunnerState {
        self.as_runner().state()
    }

    fn output(&self) -> Vec<String> {
        self.as_runner().output()
    }

    fn crashed(&self) -> bool {
        self.as_runner().crashed()
    }

    fn crash_reason(&self) -> Option<CrashReason> {
        self.as_runner().crash_reason()
    }
}
