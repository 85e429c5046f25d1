use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use goanna_runner_core::{
    ChannelError, DeviceChannel, DeviceOptions, LaunchIntent, LogStream, LossyLines, RetryConfig,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

/// adb stderr fragments that mean the device itself is gone
const DISCONNECT_MARKERS: &[&str] = &[
    "device offline",
    "not found",
    "no devices",
    "unauthorized",
    "device still authorizing",
    "connection reset",
    "closed",
];

/// Lines buffered between the logcat reader and the runner
const LOG_BUFFER: usize = 1024;

/// [`DeviceChannel`] over the `adb` command line tool
pub struct AdbChannel {
    adb: PathBuf,
    serial: Option<String>,
    retry_config: RetryConfig,
}

impl AdbChannel {
    pub fn new(options: &DeviceOptions, retry_config: RetryConfig) -> Self {
        Self {
            adb: options.adb_path.clone(),
            serial: options.serial.clone(),
            retry_config,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run adb once. Only transport problems are errors here; callers
    /// judge the command's own exit status.
    async fn exec(&self, args: &[String]) -> Result<Output, ChannelError> {
        debug!(adb = %self.adb.display(), ?args, "Running adb");
        let output = self.command(args).output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_disconnect(&stderr) {
            return Err(ChannelError::Disconnected(stderr.trim().to_string()));
        }
        Ok(output)
    }

    /// Run adb and require success, returning stdout
    async fn run(&self, args: &[String]) -> Result<String, ChannelError> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            return Err(ChannelError::CommandFailed {
                command: args.join(" "),
                message: failure_message(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn shell(&self, command: &[&str]) -> Result<String, ChannelError> {
        let mut args = vec!["shell".to_string()];
        args.extend(command.iter().map(|part| shell_quote(part)));
        self.with_retry(|| self.run(&args)).await
    }

    fn create_retry_strategy(&self) -> ExponentialBuilder {
        let retry_config = &self.retry_config;
        let mut retry_builder = ExponentialBuilder::default()
            .with_min_delay(retry_config.min_delay())
            .with_max_delay(retry_config.max_delay())
            .with_max_times(retry_config.max_attempts as usize);

        if retry_config.jitter_factor > 0.0 {
            retry_builder = retry_builder.with_jitter();
        }
        retry_builder
    }

    /// Retry transient transport failures with the configured backoff
    async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        if !self.retry_config.retries_enabled() {
            return operation().await;
        }

        operation
            .retry(self.create_retry_strategy())
            .when(|e: &ChannelError| e.is_retryable())
            .notify(|e: &ChannelError, delay| {
                warn!(error = %e, ?delay, "adb command failed, retrying");
            })
            .await
    }
}

fn is_disconnect(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.starts_with("error:") && DISCONNECT_MARKERS.iter().any(|m| stderr.contains(m))
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let message = if stderr.trim().is_empty() { stdout } else { stderr };
    format!("{} ({})", message.trim(), output.status)
}

/// Quote one argument for the device shell
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// `am start` arguments for an intent
fn am_start_args(intent: &LaunchIntent) -> Vec<String> {
    let mut args = vec![
        "am".to_string(),
        "start".to_string(),
        "-W".to_string(),
        "-n".to_string(),
        intent.component(),
    ];
    if let Some(action) = &intent.action {
        args.extend(["-a".to_string(), action.clone()]);
    }
    if let Some(url) = &intent.url {
        args.extend(["-d".to_string(), url.clone()]);
    }
    for (key, value) in intent.extras() {
        args.extend(["--es".to_string(), key, value]);
    }
    args
}

/// `am start` prints failures on stdout and still exits 0
fn check_am_output(stdout: &str) -> Result<(), ChannelError> {
    match stdout.lines().find(|l| l.trim_start().starts_with("Error")) {
        Some(line) => Err(ChannelError::CommandFailed {
            command: "am start".to_string(),
            message: line.trim().to_string(),
        }),
        None => Ok(()),
    }
}

/// First pid printed by `pidof`; no output means not running
fn parse_pid(stdout: &str) -> Option<u32> {
    stdout.split_whitespace().next().and_then(|pid| pid.parse().ok())
}

/// adb reports package manager failures as `Failure [REASON]` on stdout
fn check_pm_output(command: &str, stdout: &str) -> Result<(), ChannelError> {
    if stdout.contains("Success") {
        Ok(())
    } else {
        Err(ChannelError::CommandFailed {
            command: command.to_string(),
            message: stdout.trim().to_string(),
        })
    }
}

#[async_trait]
impl DeviceChannel for AdbChannel {
    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    async fn ping(&self) -> Result<(), ChannelError> {
        let args = vec!["get-state".to_string()];
        let state = self
            .with_retry(|| self.run(&args))
            .await
            .map_err(|e| match e {
                ChannelError::CommandFailed { message, .. } => ChannelError::Disconnected(message),
                other => other,
            })?;
        match state.trim() {
            "device" => Ok(()),
            other => Err(ChannelError::Disconnected(format!("device state is {other}"))),
        }
    }

    async fn is_installed(&self, package: &str) -> Result<bool, ChannelError> {
        let args = vec![
            "shell".to_string(),
            "pm".to_string(),
            "path".to_string(),
            shell_quote(package),
        ];
        let output = self.with_retry(|| self.exec(&args)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|l| l.starts_with("package:")))
    }

    async fn install(&self, archive: &Path) -> Result<(), ChannelError> {
        let args = vec![
            "install".to_string(),
            "-r".to_string(),
            archive.display().to_string(),
        ];
        let output = self.exec(&args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && !stdout.contains("Success") {
            return Err(ChannelError::CommandFailed {
                command: "install".to_string(),
                message: failure_message(&output),
            });
        }
        check_pm_output("install", &stdout)
    }

    async fn uninstall(&self, package: &str) -> Result<(), ChannelError> {
        let args = vec!["uninstall".to_string(), package.to_string()];
        let output = self.exec(&args).await?;
        check_pm_output("uninstall", &String::from_utf8_lossy(&output.stdout))
    }

    async fn push(&self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        let args = vec![
            "push".to_string(),
            local.display().to_string(),
            remote.to_string(),
        ];
        self.with_retry(|| self.run(&args)).await.map(|_| ())
    }

    async fn remove(&self, remote: &str) -> Result<(), ChannelError> {
        self.shell(&["rm", "-rf", remote]).await.map(|_| ())
    }

    async fn launch(&self, intent: &LaunchIntent) -> Result<(), ChannelError> {
        let mut args = vec!["shell".to_string()];
        args.extend(am_start_args(intent).iter().map(|a| shell_quote(a)));
        // launching twice is not harmless, so no retry
        let stdout = self.run(&args).await?;
        check_am_output(&stdout)
    }

    async fn pid_of(&self, package: &str) -> Result<Option<u32>, ChannelError> {
        let args = vec![
            "shell".to_string(),
            "pidof".to_string(),
            shell_quote(package),
        ];
        // pidof exits non-zero when nothing matches
        let output = self.with_retry(|| self.exec(&args)).await?;
        Ok(parse_pid(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn signal(&self, pid: u32, signal: i32) -> Result<(), ChannelError> {
        let signal = format!("-{signal}");
        let pid = pid.to_string();
        self.shell(&["kill", &signal, &pid]).await.map(|_| ())
    }

    async fn force_stop(&self, package: &str) -> Result<(), ChannelError> {
        self.shell(&["am", "force-stop", package]).await.map(|_| ())
    }

    async fn clear_log(&self) -> Result<(), ChannelError> {
        let args = vec!["logcat".to_string(), "-c".to_string()];
        self.with_retry(|| self.run(&args)).await.map(|_| ())
    }

    async fn log_stream(&self) -> Result<LogStream, ChannelError> {
        let mut child = self
            .command(&["logcat".to_string(), "-v".to_string(), "brief".to_string()])
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Disconnected("logcat has no stdout".to_string()))?;

        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        tokio::spawn(async move {
            if !forward_lines(stdout, &tx).await {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "logcat already gone");
                }
                return;
            }
            let status = child.wait().await;
            debug!(?status, "logcat exited");
            let _ = tx
                .send(Err(ChannelError::Disconnected("logcat ended".to_string())))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Copy lines from `reader` into `tx`. Returns false once the receiving
/// side is gone, even while the reader is idle.
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    tx: &mpsc::Sender<Result<String, ChannelError>>,
) -> bool {
    let mut lines = FramedRead::new(reader, LossyLines);
    loop {
        tokio::select! {
            _ = tx.closed() => return false,
            line = lines.next() => match line {
                Some(line) => {
                    if tx.send(line.map_err(ChannelError::from)).await.is_err() {
                        return false;
                    }
                }
                None => return true,
            },
        }
    }
}
