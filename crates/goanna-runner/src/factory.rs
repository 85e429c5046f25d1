use crate::device::{AdbChannel, DeviceRunner};
use crate::instance::GoannaInstance;
use crate::local::LocalProcessRunner;
use crate::mobile::MobileAppRunner;
use crate::registry::{RunnerKind, Target, VariantRegistry};
use goanna_runner_core::{DeviceChannel, LocalBackendFactory, RunnerConfig, RunnerError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(not(unix))]
compile_error!("Unsupported platform: local runners are only implemented for Unix hosts");

/// Local backend type for the host platform
#[cfg(unix)]
pub type PlatformBackend = goanna_runner_unix::UnixLocalBackend;

/// Platform-independent factory that selects the local backend at compile time
pub struct PlatformLocalBackendFactory;

impl LocalBackendFactory for PlatformLocalBackendFactory {
    type Backend = PlatformBackend;

    fn create_backend(binary: &Path, config: &RunnerConfig) -> Self::Backend {
        #[cfg(unix)]
        return goanna_runner_unix::UnixLocalBackendFactory::create_backend(binary, config);
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return goanna_runner_unix::UnixLocalBackendFactory::platform_name();
    }
}

/// Builds the device channel for a device or mobile-app runner
pub type ChannelFactory = Arc<dyn Fn(&RunnerConfig) -> Arc<dyn DeviceChannel> + Send + Sync>;

fn adb_channel(config: &RunnerConfig) -> Arc<dyn DeviceChannel> {
    Arc::new(AdbChannel::new(&config.device, config.retry_config.clone()))
}

/// Turns an application identifier and a binary or device descriptor into
/// a runner, without launching anything.
#[derive(Clone)]
pub struct InstanceFactory {
    registry: Arc<VariantRegistry>,
    channels: ChannelFactory,
}

impl Default for InstanceFactory {
    fn default() -> Self {
        Self::new(VariantRegistry::standard())
    }
}

impl fmt::Debug for InstanceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl InstanceFactory {
    pub fn new(registry: Arc<VariantRegistry>) -> Self {
        Self {
            registry,
            channels: Arc::new(adb_channel),
        }
    }

    /// Use something other than adb to reach devices
    pub fn with_channel_factory<F>(mut self, channels: F) -> Self
    where
        F: Fn(&RunnerConfig) -> Arc<dyn DeviceChannel> + Send + Sync + 'static,
    {
        self.channels = Arc::new(channels);
        self
    }

    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    /// Decide which variant `app` and `bin` select
    pub fn resolve(
        &self,
        app: Option<&str>,
        bin: Option<&str>,
    ) -> Result<(String, RunnerKind), RunnerError> {
        match (app, bin) {
            (Some(app), _) => self
                .registry
                .lookup(app)
                .map(|kind| (app.to_string(), kind))
                .ok_or_else(|| RunnerError::unsupported(Some(app), bin)),
            (None, Some(bin)) => match Target::parse(bin) {
                Target::Binary(path) => self.registry.infer(&path),
                // a device descriptor says nothing about the app
                Target::Device(_) => Err(RunnerError::unsupported(None, Some(bin))),
            },
            (None, None) => Err(RunnerError::unsupported(None, None)),
        }
    }

    /// Build the runner for `app` and `bin`.
    ///
    /// Fails with `UnsupportedTarget` when no variant matches; nothing is
    /// launched or touched on disk either way.
    pub fn create(
        &self,
        app: Option<&str>,
        bin: Option<&str>,
        mut config: RunnerConfig,
    ) -> Result<GoannaInstance, RunnerError> {
        config.validate()?;
        let (app_id, kind) = self.resolve(app, bin)?;
        let target = bin.map(Target::parse);
        let unsupported = || RunnerError::unsupported(Some(&app_id), bin);

        if config.name.is_empty() {
            config.name = app_id.clone();
        }

        let instance = match kind {
            RunnerKind::LocalProcess => match target {
                Some(Target::Binary(path)) => {
                    GoannaInstance::Local(LocalProcessRunner::new(path, config)?)
                }
                _ => return Err(unsupported()),
            },
            RunnerKind::Device => {
                match target {
                    Some(Target::Device(serial)) if !serial.is_empty() => {
                        config.device.serial = Some(serial);
                    }
                    Some(Target::Binary(path)) => {
                        debug!(path = %path.display(), "Ignoring host path for device runner");
                    }
                    _ => {}
                }
                let channel = (self.channels)(&config);
                GoannaInstance::Device(DeviceRunner::new(channel, config)?)
            }
            RunnerKind::MobileApp => {
                let mut archive = config.device.archive.clone();
                match target {
                    Some(Target::Binary(path)) => archive = Some(path),
                    Some(Target::Device(serial)) if !serial.is_empty() => {
                        config.device.serial = Some(serial);
                    }
                    _ => {}
                }
                let channel = (self.channels)(&config);
                GoannaInstance::MobileApp(MobileAppRunner::new(channel, archive, config)?)
            }
        };

        info!(app = %app_id, %kind, "Created runner");
        Ok(instance)
    }
}
