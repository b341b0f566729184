//! Tunnel supervision
//!
//! One activation drives one tunnel process: look the tunnel up, spawn the
//! tunnel program, follow its diagnostic stream until the first public
//! endpoint shows up, record it in the registry, notify the requester, then
//! keep draining output until the process goes away.

use crate::error::{Result, TunnelError};
use crate::extractor::UrlExtractor;
use crate::process::{describe_exit, TunnelCommand, TunnelProcess};
use crate::registry::{Registry, TunnelRecord};
use crate::reply::ReplyChannel;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Log target for lines echoed from the tunnel program
pub const DIAGNOSTIC_TARGET: &str = "flaretun::cloudflared";

/// Default time allowed for the tunnel program to publish an endpoint
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Sent once an activation has recorded its endpoint
pub const UPDATED_MESSAGE: &str = "Tunnel Updated! Check out `list` for details~";

/// Decides which suffix turns a public link into an access link
///
/// A record's own `link_suffix` wins; otherwise a name-keyed default
/// applies, otherwise the access link is the public link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPolicy {
    defaults: HashMap<String, String>,
}

impl LinkPolicy {
    /// Policy without name-keyed defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy carrying the suffix existing registries rely on
    pub fn legacy() -> Self {
        Self::new().with_default("Claudia", "/nextcloud")
    }

    /// Add a default suffix for records named `name`
    pub fn with_default(mut self, name: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.defaults.insert(name.into(), suffix.into());
        self
    }

    /// Suffix to append for `record`
    pub fn suffix_for<'a>(&'a self, record: &'a TunnelRecord) -> &'a str {
        if !record.link_suffix.is_empty() {
            return &record.link_suffix;
        }
        self.defaults
            .get(&record.name)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// How following a diagnostic stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// An endpoint was recorded and the stream later reached its end
    Published { endpoint: String },
    /// The stream ended without any endpoint
    Ended,
    /// No endpoint appeared before the deadline
    TimedOut,
    /// The activation was cancelled, possibly after publishing
    Cancelled { endpoint: Option<String> },
}

/// A finished activation that did publish an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub name: String,
    pub endpoint: String,
    pub exit_status: String,
}

/// Runs tunnel processes and records their endpoints
pub struct Supervisor {
    registry: Arc<Registry>,
    command: TunnelCommand,
    extractor: Arc<dyn UrlExtractor>,
    policy: LinkPolicy,
    endpoint_timeout: Option<Duration>,
}

impl Supervisor {
    /// Create a supervisor with the default timeout and no link defaults
    pub fn new(
        registry: Arc<Registry>,
        command: TunnelCommand,
        extractor: Arc<dyn UrlExtractor>,
    ) -> Self {
        Self {
            registry,
            command,
            extractor,
            policy: LinkPolicy::new(),
            endpoint_timeout: Some(DEFAULT_ENDPOINT_TIMEOUT),
        }
    }

    /// Use `policy` to shape access links
    pub fn with_link_policy(mut self, policy: LinkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time allowed before the first endpoint; `None` waits forever
    pub fn with_endpoint_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    /// Registry this supervisor writes to
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Activate `name` and supervise its process until it exits
    ///
    /// Success is notified through `reply` as soon as the endpoint is
    /// recorded; the returned future only completes when the process ends
    /// or `cancel` fires. Errors are only returned for activations that
    /// never published, so callers can report them as the terminal reply.
    pub async fn activate(
        &self,
        name: &str,
        reply: &dyn ReplyChannel,
        cancel: &CancellationToken,
    ) -> Result<Activation> {
        let record = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| TunnelError::not_found(name))?;

        let mut process = TunnelProcess::spawn(&self.command, &record.local_target)?;

        if let Some(stdout) = process.take_stdout() {
            tokio::spawn(drain_stdout(record.name.clone(), stdout));
        }
        let Some(stderr) = process.take_stderr() else {
            process.kill().await;
            return Err(TunnelError::ProcessExitedWithoutEndpoint {
                name: record.name,
                status: "no diagnostic stream".to_string(),
            });
        };

        let deadline = self.deadline();
        let outcome = match self
            .follow_stream(&record, BufReader::new(stderr), reply, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                process.kill().await;
                return Err(e);
            }
        };

        match outcome {
            StreamOutcome::Published { endpoint } => {
                let exit_status = wait_or_cancel(&mut process, cancel).await;
                info!("Tunnel {} at {} ended ({})", record.name, endpoint, exit_status);
                Ok(Activation {
                    name: record.name,
                    endpoint,
                    exit_status,
                })
            }
            StreamOutcome::Cancelled {
                endpoint: Some(endpoint),
            } => {
                process.kill().await;
                info!("Tunnel {} at {} stopped on request", record.name, endpoint);
                Ok(Activation {
                    name: record.name,
                    endpoint,
                    exit_status: "cancelled".to_string(),
                })
            }
            StreamOutcome::Cancelled { endpoint: None } => {
                process.kill().await;
                Err(TunnelError::Cancelled { name: record.name })
            }
            StreamOutcome::TimedOut => {
                process.kill().await;
                Err(self.timed_out(record.name))
            }
            StreamOutcome::Ended => {
                // Output closed early; the process may still be running
                let status = tokio::select! {
                    status = wait_or_cancel(&mut process, cancel) => Some(status),
                    _ = sleep_until(deadline) => None,
                };
                match status {
                    Some(status) => Err(TunnelError::ProcessExitedWithoutEndpoint {
                        name: record.name,
                        status,
                    }),
                    None => {
                        warn!("Tunnel {} closed its output but kept running", record.name);
                        process.kill().await;
                        Err(self.timed_out(record.name))
                    }
                }
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.endpoint_timeout.map(|t| Instant::now() + t)
    }

    fn timed_out(&self, name: String) -> TunnelError {
        TunnelError::EndpointTimeout {
            name,
            timeout: self.endpoint_timeout.unwrap_or_default(),
        }
    }

    /// Follow a diagnostic stream for `record` until it ends
    ///
    /// The first endpoint found is recorded and notified; later ones are
    /// only logged. The timeout stops applying once an endpoint is known.
    pub async fn follow_stream<R>(
        &self,
        record: &TunnelRecord,
        mut reader: R,
        reply: &dyn ReplyChannel,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome>
    where
        R: AsyncBufRead + Unpin,
    {
        let deadline = self.deadline();
        let mut endpoint: Option<String> = None;
        let mut buf = Vec::new();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Activation of {} cancelled", record.name);
                    return Ok(StreamOutcome::Cancelled { endpoint });
                }
                _ = sleep_until(deadline), if endpoint.is_none() => {
                    warn!("No endpoint from tunnel {} before the deadline", record.name);
                    return Ok(StreamOutcome::TimedOut);
                }
                line = read_line_lossy(&mut reader, &mut buf) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading output of tunnel {}: {}", record.name, e);
                    break;
                }
            };

            debug!(target: DIAGNOSTIC_TARGET, tunnel = %record.name, "{}", line);

            let Some(url) = self.extractor.extract(&line) else {
                continue;
            };
            if let Some(first) = &endpoint {
                if first != url {
                    debug!("Ignoring additional endpoint {} for {}", url, record.name);
                }
                continue;
            }

            self.publish(record, url, reply).await?;
            endpoint = Some(url.to_string());
        }

        Ok(match endpoint {
            Some(endpoint) => StreamOutcome::Published { endpoint },
            None => StreamOutcome::Ended,
        })
    }

    async fn publish(
        &self,
        record: &TunnelRecord,
        public_link: &str,
        reply: &dyn ReplyChannel,
    ) -> Result<()> {
        let mut updated = record.clone();
        updated.set_links(public_link, self.policy.suffix_for(record));
        let access_link = updated.access_link.clone();

        let outcome = self.registry.upsert(updated).await?;
        info!(
            "Tunnel {} is up at {} ({:?})",
            record.name, access_link, outcome
        );

        reply.send_public(UPDATED_MESSAGE.to_string());
        Ok(())
    }
}

/// Wait for the process to exit, killing it if `cancel` fires first
async fn wait_or_cancel(process: &mut TunnelProcess, cancel: &CancellationToken) -> String {
    tokio::select! {
        status = process.wait() => describe_exit(&status),
        _ = cancel.cancelled() => {
            process.kill().await;
            "cancelled".to_string()
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Read one line, replacing invalid UTF-8 and stripping the line ending
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(|c| c == '\n' || c == '\r').to_string()))
}

/// Keep stdout flowing so the tunnel program never blocks on a full pipe
async fn drain_stdout(name: String, stdout: ChildStdout) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                debug!(target: DIAGNOSTIC_TARGET, tunnel = %name, stream = "stdout", "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading stdout of tunnel {}: {}", name, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_policy_record_suffix_wins() {
        let policy = LinkPolicy::legacy();
        let record = TunnelRecord::new("Claudia", "", "127.0.0.1:80").with_link_suffix("/files");

        assert_eq!(policy.suffix_for(&record), "/files");
    }

    #[test]
    fn test_link_policy_defaults() {
        let policy = LinkPolicy::legacy();

        let claudia = TunnelRecord::new("Claudia", "", "127.0.0.1:80");
        let other = TunnelRecord::new("claudia", "", "127.0.0.1:80");

        assert_eq!(policy.suffix_for(&claudia), "/nextcloud");
        assert_eq!(policy.suffix_for(&other), "");
        assert_eq!(LinkPolicy::new().suffix_for(&claudia), "");
    }

    #[tokio::test]
    async fn test_read_line_lossy() {
        let mut reader: &[u8] = b"first\r\nsec\xffond\nlast";
        let mut buf = Vec::new();

        assert_eq!(
            read_line_lossy(&mut reader, &mut buf).await.unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(
            read_line_lossy(&mut reader, &mut buf).await.unwrap().as_deref(),
            Some("sec\u{fffd}ond")
        );
        assert_eq!(
            read_line_lossy(&mut reader, &mut buf).await.unwrap().as_deref(),
            Some("last")
        );
        assert_eq!(read_line_lossy(&mut reader, &mut buf).await.unwrap(), None);
    }
}
