//! Runtime configuration assembled from the command line

use crate::cli::Cli;
use crate::extractor::ProviderUrlExtractor;
use crate::process::TunnelCommand;
use crate::registry::Registry;
use crate::supervisor::{LinkPolicy, Supervisor};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a tunnel manager session
#[derive(Debug, Clone)]
pub struct Config {
    /// Tunnel registry file
    pub registry_path: PathBuf,

    /// How the tunnel program is launched
    pub command: TunnelCommand,

    /// Domain public endpoints are published under
    pub provider_domain: String,

    /// Time allowed for an endpoint to appear; `None` waits forever
    pub endpoint_timeout: Option<Duration>,

    /// Name-keyed access link suffixes
    pub link_policy: LinkPolicy,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_cli(cli: &Cli) -> Self {
        let mut command = TunnelCommand::cloudflared(cli.cloudflared.clone());
        if !cli.tunnel_args.is_empty() {
            command.args = cli.tunnel_args.clone();
        }

        let base = if cli.no_default_suffixes {
            LinkPolicy::new()
        } else {
            LinkPolicy::legacy()
        };
        let link_policy = cli
            .link_suffixes
            .iter()
            .fold(base, |policy, (name, suffix)| policy.with_default(name, suffix));

        Self {
            registry_path: cli.registry.clone(),
            command,
            provider_domain: cli.provider_domain.clone(),
            endpoint_timeout: (cli.endpoint_timeout > 0)
                .then(|| Duration::from_secs(cli.endpoint_timeout)),
            link_policy,
        }
    }

    /// Registry described by this configuration
    pub fn registry(&self) -> Registry {
        Registry::new(&self.registry_path)
    }

    /// Supervisor wired to this configuration's registry and tunnel program
    pub fn build_supervisor(&self) -> Result<Supervisor> {
        let extractor = ProviderUrlExtractor::new(&self.provider_domain)
            .with_context(|| format!("Invalid provider domain {:?}", self.provider_domain))?;

        Ok(Supervisor::new(
            Arc::new(self.registry()),
            self.command.clone(),
            Arc::new(extractor),
        )
        .with_link_policy(self.link_policy.clone())
        .with_endpoint_timeout(self.endpoint_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_config_defaults() {
        let cli = Cli::try_parse_from(["flaretun", "list"]).unwrap();
        let config = Config::from_cli(&cli);

        assert_eq!(config.registry_path, PathBuf::from("tunnel_info.json"));
        assert_eq!(config.command, TunnelCommand::default());
        assert_eq!(config.provider_domain, "trycloudflare.com");
        assert_eq!(config.endpoint_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.link_policy, LinkPolicy::legacy());
    }

    #[test]
    fn test_config_overrides() {
        let cli = Cli::try_parse_from([
            "flaretun",
            "list",
            "--cloudflared",
            "/opt/cloudflared",
            "--endpoint-timeout",
            "0",
            "--no-default-suffixes",
            "--link-suffix",
            "wiki=/w",
        ])
        .unwrap();
        let config = Config::from_cli(&cli);

        assert_eq!(config.command.program, "/opt/cloudflared");
        assert_eq!(config.endpoint_timeout, None);
        assert_eq!(config.link_policy, LinkPolicy::new().with_default("wiki", "/w"));
        assert!(config.build_supervisor().is_ok());
    }
}
