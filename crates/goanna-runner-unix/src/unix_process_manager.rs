use anyhow::Result;
use async_trait::async_trait;
use goanna_runner_core::{
    OutputBuffer, ProcessError, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessStatus, ProcessTermination, TerminationResult, capture_lines,
};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::Stdio;
    use sysinfo::System;
    use tokio::io::AsyncRead;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        command: String,
        args: Vec<String>,
        started_at: Instant,
        /// Process group created at spawn; outlives the leader's pid
        pgid: Option<u32>,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
            let pgid = child.id();
            Self {
                child,
                command,
                args,
                started_at: Instant::now(),
                pgid,
            }
        }

        pub fn process_group(&self) -> Option<ProcessId> {
            self.pgid.map(ProcessId::from)
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn get_command(&self) -> &str {
            &self.command
        }

        fn get_args(&self) -> &[String] {
            &self.args
        }

        fn started_at(&self) -> Instant {
            self.started_at
        }

        async fn is_running(&self) -> bool {
            match self.get_pid() {
                // signal 0 only checks that the process exists
                Some(pid) => signal::kill(NixPid::from_raw(pid.0 as i32), None).is_ok(),
                None => false,
            }
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>, ProcessError> {
            Ok(self.child.try_wait()?.map(ProcessStatus::Exited))
        }

        async fn wait(&mut self) -> Result<ProcessStatus, ProcessError> {
            let status = self.child.wait().await?;
            Ok(ProcessStatus::Exited(status))
        }

        async fn kill(&mut self) -> Result<(), ProcessError> {
            self.child
                .kill()
                .await
                .map_err(|e| ProcessError::Other(format!("Failed to kill process: {e}")))
        }
    }

    /// Unix-specific process manager with process group and tree handling
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    fn pipe_output<R>(reader: Option<R>, output: &OutputBuffer, stream: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(reader) = reader else {
            return;
        };
        let output = output.clone();
        tokio::spawn(async move {
            if let Err(e) = capture_lines(reader, output).await {
                warn!(stream, error = %e, "Output capture ended with an error");
            }
        });
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        type Handle = UnixProcessHandle;

        async fn spawn_process(
            &self,
            command: &str,
            args: &[String],
            working_dir: Option<&Path>,
            env: &HashMap<String, String>,
            output: OutputBuffer,
        ) -> Result<Self::Handle> {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

            // own process group so the whole browser tree can be signalled at once
            cmd.process_group(0);

            let mut child = cmd
                .spawn()
                .map_err(|e| ProcessError::SpawnFailed(format!("{command}: {e}")))?;

            pipe_output(child.stdout.take(), &output, "stdout");
            pipe_output(child.stderr.take(), &output, "stderr");

            if let Some(pid) = child.id() {
                info!(%command, pid, ?args, "Spawned Unix process");
            }

            Ok(UnixProcessHandle::new(child, command.to_string(), args.to_vec()))
        }
    }

    fn classify(errno: Errno, pid: ProcessId, what: &str) -> TerminationResult {
        match errno {
            Errno::ESRCH => {
                debug!(pid = pid.0, "{what}: process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Errno::EPERM => {
                warn!(pid = pid.0, "{what}: permission denied");
                TerminationResult::PermissionDenied
            }
            e => {
                warn!(pid = pid.0, error = %e, "{what} failed");
                TerminationResult::Failed(format!("{what} failed: {e}"))
            }
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };
            match self.signal_group(pid, Signal::SIGTERM) {
                Ok(()) => {
                    info!(pid = pid.0, "Sent SIGTERM to process group");
                    TerminationResult::Success
                }
                Err(e) => classify(e, pid, "SIGTERM"),
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            // descendants that left the group still go down with the browser
            if let Ok(children) = self.find_child_processes(pid).await {
                for child in children {
                    let _ = signal::kill(NixPid::from_raw(child.0 as i32), Signal::SIGKILL);
                }
            }

            let result = match self.signal_group(pid, Signal::SIGKILL) {
                Ok(()) => {
                    info!(pid = pid.0, "Sent SIGKILL to process group");
                    TerminationResult::Success
                }
                Err(e) => classify(e, pid, "SIGKILL"),
            };

            // reap the leader
            if let Err(e) = handle.kill().await {
                debug!(pid = pid.0, error = %e, "Handle kill cleanup failed");
            }
            result
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self
                .system
                .lock()
                .map_err(|_| anyhow::anyhow!("System process table poisoned"))?;
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId::from).collect())
        }
    }

    impl UnixProcessManager {
        /// Signal the process group led by `pid`
        pub fn signal_group(&self, pid: ProcessId, signal: Signal) -> Result<(), Errno> {
            signal::killpg(NixPid::from_raw(pid.0 as i32), signal)
        }

        /// SIGKILL whatever is left in a process group; used for emergency cleanup
        pub fn kill_group(&self, pgid: ProcessId) -> TerminationResult {
            match self.signal_group(pgid, Signal::SIGKILL) {
                Ok(()) => TerminationResult::Success,
                Err(e) => classify(e, pgid, "SIGKILL group"),
            }
        }

        /// Recursively find all child processes, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    #[async_trait]
    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            debug!("Initializing Unix process manager");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use goanna_runner_core::CrashSignatures;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    async fn wait_for_line(output: &OutputBuffer, needle: &str) {
        for _ in 0..200 {
            if output.any_line(|l| l.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("line {needle:?} never showed up in {:?}", output.lines());
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout_and_stderr() {
        let manager = UnixProcessManager::new();
        let output = OutputBuffer::new(CrashSignatures::none());
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());

        let mut handle = manager
            .spawn_process("/bin/sh", &sh("echo $GREETING; echo oops >&2"), None, &env, output.clone())
            .await
            .unwrap();

        let status = handle.wait().await.unwrap();
        assert!(status.is_clean_exit());
        wait_for_line(&output, "hello").await;
        wait_for_line(&output, "oops").await;
        assert_eq!(handle.get_command(), "/bin/sh");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let manager = UnixProcessManager::new();
        let result = manager
            .spawn_process(
                "/nonexistent/goanna",
                &[],
                None,
                &HashMap::new(),
                OutputBuffer::default(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_graceful_termination() {
        let manager = UnixProcessManager::new();
        let mut handle = manager
            .spawn_process("/bin/sh", &sh("sleep 30"), None, &HashMap::new(), OutputBuffer::default())
            .await
            .unwrap();
        assert!(handle.is_running().await);

        let result = manager
            .terminate_with_grace(&mut handle, Duration::from_secs(5))
            .await;
        assert!(result.is_gone());
        assert!(handle.try_wait().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_force_kill_escalation() {
        let manager = UnixProcessManager::new();
        let output = OutputBuffer::default();
        let mut handle = manager
            .spawn_process(
                "/bin/sh",
                &sh("trap '' TERM; echo armed; while true; do sleep 0.05; done"),
                None,
                &HashMap::new(),
                output.clone(),
            )
            .await
            .unwrap();
        wait_for_line(&output, "armed").await;

        let result = manager
            .terminate_with_grace(&mut handle, Duration::from_millis(200))
            .await;
        assert_eq!(result, TerminationResult::Success);
        let status = handle.try_wait().await.unwrap();
        assert!(matches!(status, Some(s) if !s.is_clean_exit()));
    }

    #[tokio::test]
    async fn test_find_child_processes() {
        let manager = UnixProcessManager::new();
        let output = OutputBuffer::default();
        let mut handle = manager
            .spawn_process(
                "/bin/sh",
                &sh("sleep 30 & echo started; wait"),
                None,
                &HashMap::new(),
                output.clone(),
            )
            .await
            .unwrap();
        wait_for_line(&output, "started").await;

        let pid = handle.get_pid().unwrap();
        let children = manager.find_child_processes(pid).await.unwrap();
        assert!(!children.is_empty());

        manager.force_kill(&mut handle).await;
        assert!(handle.try_wait().await.unwrap().is_some());
    }
}
