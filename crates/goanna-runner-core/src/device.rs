//! The remote control channel a device-resident browser is driven through.

use crate::error::ChannelError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;
use tokio_stream::Stream;

/// Log lines read from the device; ends when the device goes away
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// Everything needed to start an application on the device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchIntent {
    pub package: String,
    pub activity: Option<String>,
    pub action: Option<String>,
    pub url: Option<String>,
    /// Command line handed to the browser through the `args` extra
    pub args: Vec<String>,
    /// Environment handed to the browser through `env0`, `env1`, ... extras
    pub env: BTreeMap<String, String>,
}

impl LaunchIntent {
    /// String extras in the order they are passed to the activity manager
    pub fn extras(&self) -> Vec<(String, String)> {
        let mut extras = Vec::new();
        if !self.args.is_empty() {
            extras.push(("args".to_string(), self.args.join(" ")));
        }
        for (index, (key, value)) in self.env.iter().enumerate() {
            extras.push((format!("env{index}"), format!("{key}={value}")));
        }
        extras
    }

    /// `package/activity`, or just the package when no activity is set
    pub fn component(&self) -> String {
        match &self.activity {
            Some(activity) => format!("{}/{}", self.package, activity),
            None => self.package.clone(),
        }
    }
}

#[async_trait]
pub trait DeviceChannel: Send + Sync + 'static {
    /// Device serial this channel talks to, if pinned
    fn serial(&self) -> Option<&str>;

    /// Fail with `ChannelError::Disconnected` unless the device is reachable
    async fn ping(&self) -> Result<(), ChannelError>;

    async fn is_installed(&self, package: &str) -> Result<bool, ChannelError>;

    async fn install(&self, archive: &Path) -> Result<(), ChannelError>;

    async fn uninstall(&self, package: &str) -> Result<(), ChannelError>;

    /// Copy a local file or directory to `remote`
    async fn push(&self, local: &Path, remote: &str) -> Result<(), ChannelError>;

    /// Recursively delete `remote`
    async fn remove(&self, remote: &str) -> Result<(), ChannelError>;

    async fn launch(&self, intent: &LaunchIntent) -> Result<(), ChannelError>;

    async fn pid_of(&self, package: &str) -> Result<Option<u32>, ChannelError>;

    /// Deliver a signal to a device process
    async fn signal(&self, pid: u32, signal: i32) -> Result<(), ChannelError>;

    async fn force_stop(&self, package: &str) -> Result<(), ChannelError>;

    async fn clear_log(&self) -> Result<(), ChannelError>;

    async fn log_stream(&self) -> Result<LogStream, ChannelError>;
}
