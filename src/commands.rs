// Command handlers for the tunnel manager CLI

use crate::cli::{Cli, Command, ConsoleCommand, ConsoleLine};
use crate::config::Config;
use crate::controller::{Controller, Intent};
use crate::error::TunnelError;
use crate::registry::{render_map, CreateOutcome, Registry, TunnelRecord};
use crate::reply::{ConsoleReply, ReplyChannel};
use anyhow::{Context, Result};
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Execute a CLI command
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = Config::from_cli(&cli);

    match cli.command {
        Command::Serve { secret } => handle_serve(config, secret).await,
        Command::List => handle_list(config).await,
        Command::Create {
            name,
            local_target,
            description,
            link_suffix,
        } => handle_create(config, name, local_target, description, link_suffix).await,
    }
}

async fn handle_serve(config: Config, secret: Option<String>) -> Result<()> {
    info!("Tunnel manager is loading...");
    info!("  Registry: {:?}", config.registry_path);
    info!("  Tunnel program: {} {:?}", config.command.program, config.command.args);

    if secret.is_none() {
        warn!("No create secret configured, console `create` is disabled");
    }

    let supervisor = Arc::new(config.build_supervisor()?);
    let controller = Controller::boot(supervisor)
        .await
        .context("Failed to reset tunnel links")?;

    info!("Tunnel manager is up and running. Type `help` for commands, Ctrl+C to stop.");

    let reply: Arc<dyn ReplyChannel> = Arc::new(ConsoleReply);
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.recv(), if stdin_open => match line {
                Some(line) => {
                    handle_console_line(&controller, &line, secret.as_deref(), Arc::clone(&reply))
                        .await;
                }
                None => {
                    info!("stdin closed, tunnels keep running until Ctrl+C");
                    stdin_open = false;
                }
            },
        }
    }

    println!("\nStopping tunnels...");
    controller.shutdown().await;

    Ok(())
}

/// Read stdin lines on a plain thread
///
/// A blocking read cannot be cancelled, so it must not hold up runtime
/// shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read from stdin: {}", e);
                    break;
                }
            }
        }
    });

    rx
}

/// Parse and dispatch one console line
pub async fn handle_console_line(
    controller: &Controller,
    line: &str,
    secret: Option<&str>,
    reply: Arc<dyn ReplyChannel>,
) {
    if line.trim().is_empty() {
        return;
    }

    let parsed = match ConsoleLine::parse_line(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            reply.send_ephemeral(e.render().to_string());
            return;
        }
    };

    match console_intent(parsed.command, secret) {
        Ok(intent) => controller.dispatch(intent, reply).await,
        Err(e) => reply.send_ephemeral(e.to_string()),
    }
}

/// Turn a console command into an intent, checking the create secret
pub fn console_intent(
    command: ConsoleCommand,
    secret: Option<&str>,
) -> Result<Intent, TunnelError> {
    Ok(match command {
        ConsoleCommand::Help => Intent::Help,
        ConsoleCommand::List => Intent::List,
        ConsoleCommand::Activate { name } => Intent::Activate { name },
        ConsoleCommand::Stop { name } => Intent::Stop { name },
        ConsoleCommand::Create {
            name,
            local_target,
            secret: supplied,
            link_suffix,
            description,
        } => {
            match (secret, supplied.as_deref()) {
                (Some(expected), Some(supplied)) if expected == supplied => {}
                _ => return Err(TunnelError::Unauthorized),
            }
            Intent::Create {
                name,
                description: description.join(" "),
                local_target,
                link_suffix,
            }
        }
    })
}

/// Printed after the one-shot listing, which skips the startup reset
pub const OFFLINE_LIST_NOTE: &str =
    "(Links are shown as last recorded and may be stale if `flaretun serve` is not running.)";

async fn handle_list(config: Config) -> Result<()> {
    println!("{}", offline_listing(&config.registry()).await);
    Ok(())
}

/// Registry listing for the one-shot `list` subcommand
pub async fn offline_listing(registry: &Registry) -> String {
    let map = registry.load().await;
    let mut listing = render_map(&map);
    if map.values().any(TunnelRecord::is_active) {
        listing.push_str("\n\n");
        listing.push_str(OFFLINE_LIST_NOTE);
    }
    listing
}

async fn handle_create(
    config: Config,
    name: String,
    local_target: String,
    description: String,
    link_suffix: Option<String>,
) -> Result<()> {
    let registry = config.registry();
    let record = TunnelRecord::new(&name, description, &local_target)
        .with_link_suffix(link_suffix.unwrap_or_default());

    match registry.create_record(record).await? {
        CreateOutcome::Created => {
            println!("✓ Tunnel '{}' registered", name);
            println!("  Local target: {}", local_target);
            println!("  Registry: {:?}", registry.path());
        }
        CreateOutcome::AlreadyExists => {
            println!("{}", TunnelError::AlreadyExists { name });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_command(secret: Option<&str>) -> ConsoleCommand {
        ConsoleCommand::Create {
            name: "blog".to_string(),
            local_target: "127.0.0.1:8080".to_string(),
            secret: secret.map(str::to_string),
            link_suffix: None,
            description: vec!["My".to_string(), "blog".to_string()],
        }
    }

    #[test]
    fn test_create_requires_matching_secret() {
        let intent = console_intent(create_command(Some("s3")), Some("s3")).unwrap();
        assert_eq!(
            intent,
            Intent::Create {
                name: "blog".to_string(),
                description: "My blog".to_string(),
                local_target: "127.0.0.1:8080".to_string(),
                link_suffix: None,
            }
        );

        assert!(matches!(
            console_intent(create_command(Some("nope")), Some("s3")),
            Err(TunnelError::Unauthorized)
        ));
        assert!(matches!(
            console_intent(create_command(None), Some("s3")),
            Err(TunnelError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_offline_listing_flags_recorded_links() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("tunnels.json"));
        registry.create("blog", "My blog", "127.0.0.1:8080").await.unwrap();

        let listing = offline_listing(&registry).await;
        assert!(listing.contains("**Status:** Inactive"));
        assert!(!listing.contains(OFFLINE_LIST_NOTE));

        let mut live = TunnelRecord::new("blog", "", "127.0.0.1:8080");
        live.set_links("https://old.trycloudflare.com", "");
        registry.upsert(live).await.unwrap();

        let listing = offline_listing(&registry).await;
        assert!(listing.contains("Active at https://old.trycloudflare.com"));
        assert!(listing.ends_with(OFFLINE_LIST_NOTE));
    }

    #[test]
    fn test_create_disabled_without_secret() {
        assert!(matches!(
            console_intent(create_command(Some("anything")), None),
            Err(TunnelError::Unauthorized)
        ));
    }

    #[test]
    fn test_other_commands_need_no_secret() {
        assert_eq!(
            console_intent(ConsoleCommand::Activate { name: "blog".to_string() }, None).unwrap(),
            Intent::Activate {
                name: "blog".to_string()
            }
        );
        assert_eq!(console_intent(ConsoleCommand::List, None).unwrap(), Intent::List);
    }
}
