//! Error types for tunnel lifecycle operations

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while managing tunnels
///
/// Every variant renders as a single sentence that is safe to hand back to
/// whoever issued the request.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No tunnel with the requested name exists
    #[error("{name}'s tunnel doesn't exist... or you made a typo~")]
    NotFound {
        /// Requested tunnel name
        name: String,
    },

    /// A tunnel with this name is already registered
    #[error("Entry for {name} already exists.")]
    AlreadyExists {
        /// Conflicting tunnel name
        name: String,
    },

    /// Backing file is not UTF-8 or not a JSON object of tunnel records
    ///
    /// Never surfaced by the public registry API; readers treat it as an
    /// empty registry.
    #[error("Tunnel registry {path:?} is corrupt: {reason}")]
    StoreCorrupt {
        /// Path of the backing file
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// The backing file exists but could not be read
    ///
    /// Unlike corruption this is never recovered from, so an unreadable
    /// registry is not overwritten.
    #[error("Failed to read tunnel registry {path:?}: {source}")]
    StoreReadFailed {
        /// Path of the backing file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Persisting the registry failed
    #[error("Failed to save tunnel registry {path:?}: {source}")]
    StoreWriteFailed {
        /// Path of the backing file
        path: PathBuf,
        /// Underlying I/O or encoding error
        #[source]
        source: std::io::Error,
    },

    /// The tunnel program could not be started
    #[error("Failed to start {program}: {source}. Is it installed?")]
    ProcessSpawnFailed {
        /// Program that was invoked
        program: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The tunnel program exited before printing a public endpoint
    #[error("Tunnel {name} did not come up: the tunnel process exited ({status}) before publishing a link")]
    ProcessExitedWithoutEndpoint {
        /// Tunnel name
        name: String,
        /// Exit status description
        status: String,
    },

    /// No public endpoint appeared within the configured time
    #[error("Tunnel {name} did not come up within {timeout:?}, the tunnel process was stopped")]
    EndpointTimeout {
        /// Tunnel name
        name: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// The activation was cancelled before a public endpoint appeared
    #[error("Activation of {name} was cancelled")]
    Cancelled {
        /// Tunnel name
        name: String,
    },

    /// Request parameters were rejected
    #[error("Invalid request: {message}")]
    InvalidInput {
        /// What was wrong with the request
        message: String,
    },

    /// Caller failed the command layer's secret check
    #[error("Wrong password! This command is for the host only. Use `help` for the list of available commands!")]
    Unauthorized,
}

impl TunnelError {
    /// Create a new invalid-input error
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
