//! flaretun - named reverse tunnels behind NAT
//!
//! This library keeps a registry of named tunnels and their local targets,
//! activates them by running `cloudflared` quick tunnels, picks the public
//! link out of the tunnel program's output and records it for end users.

pub mod cli;
pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod extractor;
pub mod process;
pub mod registry;
pub mod reply;
pub mod supervisor;

pub use config::Config;
pub use controller::{Controller, Intent};
pub use error::{Result, TunnelError};
pub use extractor::{ProviderUrlExtractor, UrlExtractor};
pub use process::{TunnelCommand, TunnelProcess};
pub use registry::{CreateOutcome, Registry, TunnelMap, TunnelRecord, UpsertOutcome};
pub use reply::{ChannelReply, ConsoleReply, Reply, ReplyChannel, Visibility};
pub use supervisor::{Activation, LinkPolicy, StreamOutcome, Supervisor};
