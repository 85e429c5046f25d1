use crate::factory::{PlatformBackend, PlatformLocalBackendFactory};
use goanna_runner_core::{LocalBackendFactory, ProfileContext, RunnerConfig, RunnerError, Supervisor};
use std::path::Path;
use tracing::debug;

/// A browser binary running on this host
pub struct LocalProcessRunner {
    inner: Supervisor<PlatformBackend>,
}

impl LocalProcessRunner {
    pub fn new(binary: impl AsRef<Path>, config: RunnerConfig) -> Result<Self, RunnerError> {
        let binary = binary.as_ref();
        debug!(
            binary = %binary.display(),
            platform = PlatformLocalBackendFactory::platform_name(),
            "Creating local runner"
        );
        let backend = PlatformLocalBackendFactory::create_backend(binary, &config);
        Ok(Self {
            inner: Supervisor::new(backend, config)?,
        })
    }

    pub fn with_profile(self, profile: ProfileContext) -> Self {
        Self {
            inner: self.inner.with_profile(profile),
        }
    }

    pub fn supervisor(&self) -> &Supervisor<PlatformBackend> {
        &self.inner
    }
}

crate::delegate_runner!(LocalProcessRunner);
