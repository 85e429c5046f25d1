//! Launch, supervise and tear down Goanna-based browsers for automated tests.
//!
//! [`InstanceFactory`] maps an application identifier and a binary path or
//! `device:<serial>` descriptor to one of the runner variants, each of which
//! implements [`Runner`]:
//!
//! - [`LocalProcessRunner`] for a browser binary on this host
//! - [`DeviceRunner`] for a browser package already on an attached device
//! - [`MobileAppRunner`] for a package installed on the device for each run

/// Implement [`Runner`] for a newtype around a `Supervisor`
macro_rules! delegate_runner {
    ($runner:ty) => {
        #[async_trait::async_trait]
        impl goanna_runner_core::Runner for $runner {
            async fn start(&self) -> Result<(), goanna_runner_core::RunnerError> {
                self.inner.start().await
            }

            async fn stop(&self, graceful: bool) -> Result<(), goanna_runner_core::RunnerError> {
                self.inner.stop(graceful).await
            }

            async fn wait(
                &self,
                timeout: Option<std::time::Duration>,
            ) -> Result<goanna_runner_core::WaitOutcome, goanna_runner_core::RunnerError> {
                self.inner.wait(timeout).await
            }

            fn is_running(&self) -> bool {
                self.inner.is_running()
            }

            fn state(&self) -> goanna_runner_core::RunnerState {
                self.inner.state()
            }

            fn output(&self) -> Vec<String> {
                self.inner.output()
            }

            fn crashed(&self) -> bool {
                self.inner.crashed()
            }

            fn crash_reason(&self) -> Option<goanna_runner_core::CrashReason> {
                self.inner.crash_reason()
            }
        }
    };
}
pub(crate) use delegate_runner;

mod device;
mod factory;
mod instance;
mod local;
mod mobile;
mod registry;

pub use device::{AdbChannel, DeviceBackend, DeviceProcessHandle, DeviceRunner};
pub use factory::{ChannelFactory, InstanceFactory, PlatformBackend, PlatformLocalBackendFactory};
pub use instance::GoannaInstance;
pub use local::LocalProcessRunner;
pub use mobile::{AppInstallBackend, MobileAppRunner};
pub use registry::{DEVICE_PREFIX, RunnerKind, Target, VariantRegistry, VariantRegistryBuilder};

// Re-export core functionality
pub use goanna_runner_core::*;

/// Build a runner with the standard registry and adb for devices
pub fn create(
    app: Option<&str>,
    bin: Option<&str>,
    config: RunnerConfig,
) -> Result<GoannaInstance, RunnerError> {
    InstanceFactory::default().create(app, bin, config)
}
