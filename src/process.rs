//! Tunnel process management
//!
//! This module describes how the external tunnel program is invoked and
//! wraps the spawned child so its diagnostic streams can be consumed by the
//! supervisor.

use crate::error::{Result, TunnelError};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Placeholder replaced by the local target in [`TunnelCommand::args`]
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// How to launch the tunnel program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    /// Program to run (e.g. "cloudflared")
    pub program: String,

    /// Arguments; occurrences of `{target}` are replaced by the local target
    pub args: Vec<String>,
}

impl TunnelCommand {
    /// Quick tunnel through `cloudflared tunnel --url <target>`
    pub fn cloudflared(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![
                "tunnel".to_string(),
                "--url".to_string(),
                TARGET_PLACEHOLDER.to_string(),
            ],
        }
    }

    /// Arguments for exposing `target`
    pub fn args_for(&self, target: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(TARGET_PLACEHOLDER, target))
            .collect()
    }
}

impl Default for TunnelCommand {
    fn default() -> Self {
        Self::cloudflared("cloudflared")
    }
}

/// A running tunnel program
///
/// The child is killed if this handle is dropped while it is still running,
/// so tunnels do not outlive the host process.
pub struct TunnelProcess {
    child: Child,
    program: String,
}

impl TunnelProcess {
    /// Spawn the tunnel program for `target` with piped stdout and stderr
    pub fn spawn(command: &TunnelCommand, target: &str) -> Result<Self> {
        let args = command.args_for(target);

        info!("Spawning tunnel process...");
        info!("  Command: {}", command.program);
        info!("  Args: {:?}", args);

        let child = Command::new(&command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::ProcessSpawnFailed {
                program: command.program.clone(),
                source,
            })?;

        info!("Tunnel process spawned with PID: {:?}", child.id());

        Ok(Self {
            child,
            program: command.program.clone(),
        })
    }

    /// Get the process ID, if the process has not been reaped yet
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Program name this process was started from
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take the diagnostic (stderr) stream
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Take the stdout stream
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        info!("Tunnel process {} exited: {}", self.program, status);
        Ok(status)
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) {
        debug!("Killing tunnel process (PID: {:?})", self.pid());
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill tunnel process {}: {}", self.program, e);
        }
    }
}

/// Short description of how a process ended
pub fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown status: {}", e),
    }
}
