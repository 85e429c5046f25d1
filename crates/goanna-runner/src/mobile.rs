use crate::device::{AdbChannel, DeviceBackend, DeviceProcessHandle};
use async_trait::async_trait;
use goanna_runner_core::{
    DeviceChannel, Liveness, OutputBuffer, ProcessBackend, ProfileContext, RunnerConfig,
    RunnerError, Supervisor, TerminationResult,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Brackets every run of a [`DeviceBackend`] with a fresh install of the
/// browser package and an uninstall afterwards.
///
/// Without an archive the package must already be on the device and is
/// left there.
pub struct AppInstallBackend {
    inner: DeviceBackend,
    archive: Option<PathBuf>,
    /// This backend installed the package and owes an uninstall
    installed: AtomicBool,
}

impl AppInstallBackend {
    pub fn new(inner: DeviceBackend, archive: Option<PathBuf>) -> Self {
        Self {
            inner,
            archive,
            installed: AtomicBool::new(false),
        }
    }

    pub fn archive(&self) -> Option<&Path> {
        self.archive.as_deref()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    fn channel(&self) -> &Arc<dyn DeviceChannel> {
        self.inner.channel()
    }

    async fn install(&self, archive: &Path) -> Result<(), RunnerError> {
        let package = self.inner.package();
        self.channel().ping().await?;
        if self.channel().is_installed(package).await? {
            debug!(%package, "Removing previously installed package");
            self.channel().uninstall(package).await?;
        }
        self.channel().install(archive).await?;
        self.installed.store(true, Ordering::SeqCst);
        info!(%package, archive = %archive.display(), "Installed package");
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), RunnerError> {
        if !self.installed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let package = self.inner.package();
        self.channel().uninstall(package).await?;
        info!(%package, "Uninstalled package");
        Ok(())
    }
}

#[async_trait]
impl ProcessBackend for AppInstallBackend {
    type Handle = DeviceProcessHandle;

    fn describe(&self) -> String {
        format!("mobile-app:{}", self.inner.describe())
    }

    async fn prepare(&self, profile: &ProfileContext) -> Result<(), RunnerError> {
        if let Some(archive) = &self.archive {
            self.install(archive).await?;
        }
        self.inner.prepare(profile).await
    }

    async fn launch(
        &self,
        profile: &ProfileContext,
        output: OutputBuffer,
    ) -> Result<Self::Handle, RunnerError> {
        self.inner.launch(profile, output).await
    }

    async fn probe(&self, handle: &mut Self::Handle) -> Result<Liveness, RunnerError> {
        self.inner.probe(handle).await
    }

    async fn terminate(
        &self,
        handle: &mut Self::Handle,
        graceful: bool,
        grace: Duration,
    ) -> TerminationResult {
        self.inner.terminate(handle, graceful, grace).await
    }

    /// Uninstall runs even when the inner teardown failed
    async fn teardown(&self, profile: Option<&ProfileContext>) -> Result<(), RunnerError> {
        let inner = self.inner.teardown(profile).await;
        let uninstall = self.uninstall().await;
        match (inner, uninstall) {
            (Err(e), Err(uninstall_error)) => {
                warn!(error = %uninstall_error, "Uninstall failed");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

/// A device browser installed from a package archive for the duration of each run
pub struct MobileAppRunner {
    inner: Supervisor<AppInstallBackend>,
}

impl MobileAppRunner {
    pub fn new(
        channel: Arc<dyn DeviceChannel>,
        archive: Option<PathBuf>,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        let backend = AppInstallBackend::new(DeviceBackend::new(channel, &config), archive);
        Ok(Self {
            inner: Supervisor::new(backend, config)?,
        })
    }

    /// Open an adb channel from the device options in `config`
    pub fn adb(config: RunnerConfig) -> Result<Self, RunnerError> {
        let channel = AdbChannel::new(&config.device, config.retry_config.clone());
        let archive = config.device.archive.clone();
        Self::new(Arc::new(channel), archive, config)
    }

    pub fn with_profile(self, profile: ProfileContext) -> Self {
        Self {
            inner: self.inner.with_profile(profile),
        }
    }

    pub fn supervisor(&self) -> &Supervisor<AppInstallBackend> {
        &self.inner
    }
}

crate::delegate_runner!(MobileAppRunner);
