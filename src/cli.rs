// CLI definitions for the tunnel manager and its interactive console

use crate::extractor::DEFAULT_PROVIDER_DOMAIN;
use crate::registry::DEFAULT_REGISTRY_PATH;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// flaretun - keep named cloudflared quick tunnels reachable
///
/// Tunnels are registered once with a local target; activating one starts
/// cloudflared and records the public link it is given.
#[derive(Debug, Parser)]
#[command(name = "flaretun", author, version, about, long_about = None)]
pub struct Cli {
    /// Tunnel registry file
    #[arg(short, long, env = "FLARETUN_REGISTRY", default_value = DEFAULT_REGISTRY_PATH, global = true)]
    pub registry: PathBuf,

    /// Tunnel program to run
    #[arg(long, env = "FLARETUN_CLOUDFLARED", default_value = "cloudflared", global = true)]
    pub cloudflared: String,

    /// Argument passed to the tunnel program; `{target}` is replaced by the
    /// local target. Repeat for each argument (default: tunnel --url {target})
    #[arg(long = "tunnel-arg", allow_hyphen_values = true, global = true)]
    pub tunnel_args: Vec<String>,

    /// Domain under which public endpoints are published
    #[arg(long, default_value = DEFAULT_PROVIDER_DOMAIN, global = true)]
    pub provider_domain: String,

    /// Seconds to wait for a public endpoint before giving up (0 = forever)
    #[arg(long, default_value_t = 60, global = true)]
    pub endpoint_timeout: u64,

    /// Default access link suffix for a tunnel name, as NAME=SUFFIX
    #[arg(long = "link-suffix", value_parser = parse_link_suffix, global = true)]
    pub link_suffixes: Vec<(String, String)>,

    /// Do not apply the built-in name-keyed link suffixes
    #[arg(long, global = true)]
    pub no_default_suffixes: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reset all links, then accept commands on stdin until Ctrl+C
    Serve {
        /// Secret required by the console `create` command
        #[arg(long, env = "FLARE_PASS", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Print the tunnel listing
    List,

    /// Register a new tunnel
    Create {
        /// Tunnel name
        #[arg(short, long)]
        name: String,

        /// Local address to expose (e.g. 127.0.0.1:8080)
        #[arg(short = 't', long)]
        local_target: String,

        /// Description shown in the listing
        #[arg(short, long, default_value = "")]
        description: String,

        /// Path appended to the public link for end users
        #[arg(long)]
        link_suffix: Option<String>,
    },
}

/// One line typed into the `serve` console
#[derive(Debug, Parser)]
#[command(
    name = "console",
    no_binary_name = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
pub struct ConsoleLine {
    #[command(subcommand)]
    pub command: ConsoleCommand,
}

/// Console commands
#[derive(Debug, Subcommand)]
pub enum ConsoleCommand {
    /// Show instructions
    Help,

    /// List existing tunnels
    List,

    /// Activate or restart a tunnel
    Activate {
        /// Tunnel name
        name: String,
    },

    /// Stop a running activation
    Stop {
        /// Tunnel name
        name: String,
    },

    /// Create a tunnel (host only)
    Create {
        /// Tunnel name
        name: String,

        /// Local address to expose
        local_target: String,

        /// Host secret
        #[arg(long)]
        secret: Option<String>,

        /// Path appended to the public link for end users
        #[arg(long)]
        link_suffix: Option<String>,

        /// Description shown in the listing
        #[arg(trailing_var_arg = true)]
        description: Vec<String>,
    },
}

impl ConsoleLine {
    /// Parse a console line split on whitespace
    pub fn parse_line(line: &str) -> Result<Self, clap::Error> {
        Self::try_parse_from(line.split_whitespace())
    }
}

fn parse_link_suffix(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, suffix)) if !name.is_empty() => Ok((name.to_string(), suffix.to_string())),
        _ => Err(format!("expected NAME=SUFFIX, got {:?}", raw)),
    }
}
