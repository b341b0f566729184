//! Lifecycle controller
//!
//! Entry point used by the command layer. Booting the controller clears
//! every advertised link, so a session always starts with all tunnels
//! inactive; after that it only routes intents to the registry and the
//! supervisor.

use crate::error::{Result, TunnelError};
use crate::registry::{CreateOutcome, Registry, TunnelRecord};
use crate::reply::ReplyChannel;
use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Immediate acknowledgement of an activation request
pub const ACTIVATING_MESSAGE: &str = "Activating Tunnel~ Please Wait!";

/// Static instructions returned by the `help` intent
pub const HELP_TEXT: &str = "\
Hi! I'm Flare-chan~ your friendly reverse proxy tunnel manager!
Our services are reachable through short-lived tunnels, and I'm the one
who hands out the links to them!

Here are the commands:
`help`: Pull up these friendly instructions!
`list`: Show every tunnel and the link it is reachable at.
`activate <name>`: Bring a tunnel (back) up when its link is broken!
`stop <name>`: Give up on a tunnel that is still starting or running.
`create`: Register a new tunnel. This one is for the host only~";

/// A request from the command layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Help,
    List,
    Create {
        name: String,
        description: String,
        local_target: String,
        link_suffix: Option<String>,
    },
    Activate {
        name: String,
    },
    Stop {
        name: String,
    },
}

struct RunningActivation {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Routes intents to the registry and the supervisor
pub struct Controller {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    running: Arc<Mutex<HashMap<Uuid, RunningActivation>>>,
}

impl Controller {
    /// Reset all links and return a controller ready for requests
    ///
    /// Endpoints advertised by a previous session are assumed stale, even
    /// if their tunnel processes happen to still be alive.
    pub async fn boot(supervisor: Arc<Supervisor>) -> Result<Self> {
        let registry = Arc::clone(supervisor.registry());
        registry.reset_all_links().await?;

        Ok(Self {
            registry,
            supervisor,
            running: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Registry used by this controller
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Instructions for users
    pub fn help(&self) -> &'static str {
        HELP_TEXT
    }

    /// Listing of all tunnels
    pub async fn list(&self) -> String {
        self.registry.render().await
    }

    /// Register a new tunnel
    pub async fn create(
        &self,
        name: &str,
        description: &str,
        local_target: &str,
        link_suffix: Option<&str>,
    ) -> Result<CreateOutcome> {
        let record = TunnelRecord::new(name, description, local_target)
            .with_link_suffix(link_suffix.unwrap_or_default());
        self.registry.create_record(record).await
    }

    /// Acknowledge and start activating `name` in the background
    ///
    /// The terminal reply (success or failure) arrives later on `reply`.
    pub async fn activate(&self, name: &str, reply: Arc<dyn ReplyChannel>) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        reply.send_ephemeral(ACTIVATING_MESSAGE.to_string());
        info!("Activation {} of tunnel {} requested", id, name);

        let supervisor = Arc::clone(&self.supervisor);
        let running = Arc::clone(&self.running);
        let task_name = name.to_string();
        let task_cancel = cancel.clone();

        // Hold the map while spawning so the task cannot deregister before it is registered
        let mut guard = self.running.lock().await;
        let task = tokio::spawn(async move {
            match supervisor
                .activate(&task_name, reply.as_ref(), &task_cancel)
                .await
            {
                Ok(activation) => {
                    info!(
                        "Activation {} of {} finished, process {}",
                        id, activation.name, activation.exit_status
                    );
                }
                Err(e) => {
                    warn!("Activation {} of {} failed: {}", id, task_name, e);
                    reply.send_public(e.to_string());
                }
            }
            running.lock().await.remove(&id);
        });

        guard.insert(
            id,
            RunningActivation {
                name: name.to_string(),
                cancel,
                task,
            },
        );

        id
    }

    /// Cancel every running activation of `name`, returning how many
    pub async fn stop(&self, name: &str) -> usize {
        let running = self.running.lock().await;
        let mut stopped = 0;
        for activation in running.values().filter(|a| a.name == name) {
            activation.cancel.cancel();
            stopped += 1;
        }
        stopped
    }

    /// Names of tunnels with a running activation
    pub async fn running(&self) -> Vec<String> {
        let running = self.running.lock().await;
        let mut names: Vec<String> = running.values().map(|a| a.name.clone()).collect();
        names.sort();
        names
    }

    /// Cancel all activations and wait for their tasks to finish
    pub async fn shutdown(&self) {
        let drained: Vec<RunningActivation> = {
            let mut running = self.running.lock().await;
            running.drain().map(|(_, activation)| activation).collect()
        };

        info!("Stopping {} running activation(s)", drained.len());
        for activation in &drained {
            activation.cancel.cancel();
        }
        futures::future::join_all(drained.into_iter().map(|a| a.task)).await;
    }

    /// Handle one intent, replying on `reply`
    ///
    /// Every intent gets exactly one terminal reply; activation also gets
    /// an immediate acknowledgement.
    pub async fn dispatch(&self, intent: Intent, reply: Arc<dyn ReplyChannel>) {
        match intent {
            Intent::Help => reply.send_ephemeral(self.help().to_string()),
            Intent::List => reply.send_ephemeral(self.list().await),
            Intent::Create {
                name,
                description,
                local_target,
                link_suffix,
            } => {
                let message = match self
                    .create(&name, &description, &local_target, link_suffix.as_deref())
                    .await
                {
                    Ok(CreateOutcome::Created) => format!(
                        "New tunnel entry for {} at {} has been added.",
                        name, local_target
                    ),
                    Ok(CreateOutcome::AlreadyExists) => {
                        TunnelError::AlreadyExists { name }.to_string()
                    }
                    Err(e) => e.to_string(),
                };
                reply.send_ephemeral(message);
            }
            Intent::Activate { name } => {
                self.activate(&name, reply).await;
            }
            Intent::Stop { name } => {
                let message = match self.stop(&name).await {
                    0 => format!("No running activation for {}.", name),
                    n => format!("Stopping {} activation(s) of {}...", n, name),
                };
                reply.send_ephemeral(message);
            }
        }
    }
}
