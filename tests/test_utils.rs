//! Test utilities and fixtures for flaretun
//!
//! Shared helpers for building registries in temporary directories,
//! supervisors driven by small shell scripts instead of cloudflared, and
//! collecting replies.

#![allow(dead_code)]

use flaretun::supervisor::LinkPolicy;
use flaretun::{ProviderUrlExtractor, Registry, Reply, Supervisor, TunnelCommand};
use std::future::Future;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Registry backed by a file inside `dir`
pub fn temp_registry(dir: &TempDir) -> Arc<Registry> {
    Arc::new(Registry::new(dir.path().join("tunnel_info.json")))
}

/// Tunnel command that runs `script` with `sh -c`
///
/// `{target}` inside the script is replaced by the local target.
pub fn script_command(script: &str) -> TunnelCommand {
    TunnelCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

/// Supervisor for quick tunnels with the legacy link policy
pub fn test_supervisor(
    registry: Arc<Registry>,
    command: TunnelCommand,
    timeout: Option<Duration>,
) -> Supervisor {
    let extractor = ProviderUrlExtractor::cloudflare().expect("valid pattern");
    Supervisor::new(registry, command, Arc::new(extractor))
        .with_link_policy(LinkPolicy::legacy())
        .with_endpoint_timeout(timeout)
}

/// Wait for the next reply, failing the test after a few seconds
pub async fn next_reply(rx: &mut UnboundedReceiver<Reply>) -> Reply {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timed out waiting for a reply")
        .expect("Reply channel closed")
}

/// Everything already queued on the reply channel
pub fn drain_replies(rx: &mut UnboundedReceiver<Reply>) -> Vec<Reply> {
    let mut replies = Vec::new();
    while let Ok(reply) = rx.try_recv() {
        replies.push(reply);
    }
    replies
}

/// Poll an async condition until it holds or the timeout elapses
pub async fn eventually<F, Fut>(mut condition: F, timeout_secs: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Check if a command is available in PATH
pub fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_command_substitutes_target() {
        let command = script_command("echo {target} >&2");
        assert_eq!(
            command.args_for("127.0.0.1:1"),
            vec!["-c", "echo 127.0.0.1:1 >&2"]
        );
    }

    #[test]
    fn test_temp_registry_path() {
        let dir = temp_dir();
        let registry = temp_registry(&dir);
        assert!(registry.path().starts_with(dir.path()));
    }
}
