//! Durable registry of named tunnels
//!
//! The registry lives in a single JSON object keyed by tunnel name. Every
//! mutation is a load-modify-persist transaction serialised behind an
//! in-process mutex and an exclusive lock on a sibling `.lock` file, so
//! concurrent activations and creations never lose each other's updates,
//! even from another process. Malformed content is treated as an empty
//! registry; a file that cannot be read is never overwritten.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Deserializer, Serialize};
use fs4::fs_std::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default location of the registry file
pub const DEFAULT_REGISTRY_PATH: &str = "tunnel_info.json";

/// Tunnel records keyed by name
pub type TunnelMap = BTreeMap<String, TunnelRecord>;

/// One logical tunnel
///
/// Field names on disk (`localhost`, `flarelink`, `accesslink`) are kept
/// so existing registry files stay readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    /// Unique, case-sensitive name; the key in the JSON object
    #[serde(skip)]
    pub name: String,

    /// Free-text description supplied at creation
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,

    /// Local address exposed by the tunnel (e.g. `127.0.0.1:8080`)
    #[serde(rename = "localhost", default, deserialize_with = "null_as_empty")]
    pub local_target: String,

    /// Raw endpoint assigned for the current activation, empty when inactive
    #[serde(rename = "flarelink", default, deserialize_with = "null_as_empty")]
    pub public_link: String,

    /// Link handed to end users, empty when inactive
    #[serde(rename = "accesslink", default, deserialize_with = "null_as_empty")]
    pub access_link: String,

    /// Path appended to the public link to form the access link
    #[serde(
        rename = "linksuffix",
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "String::is_empty"
    )]
    pub link_suffix: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl TunnelRecord {
    /// Create an inactive record
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        local_target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            local_target: local_target.into(),
            ..Self::default()
        }
    }

    /// Set the per-tunnel access link suffix
    pub fn with_link_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.link_suffix = suffix.into();
        self
    }

    /// Whether the record currently advertises an endpoint
    pub fn is_active(&self) -> bool {
        !self.access_link.is_empty()
    }

    /// Set both links from a freshly published endpoint
    pub fn set_links(&mut self, public_link: &str, suffix: &str) {
        self.public_link = public_link.to_string();
        self.access_link = format!("{}{}", public_link, suffix);
    }

    /// Mark the record inactive
    pub fn clear_links(&mut self) {
        self.public_link.clear();
        self.access_link.clear();
    }

    /// Both links set, or both empty
    pub fn links_consistent(&self) -> bool {
        self.public_link.is_empty() == self.access_link.is_empty()
    }
}

/// Result of [`Registry::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Result of [`Registry::create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Owner of the on-disk registry
pub struct Registry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Registry {
    /// Create a registry backed by the given file
    ///
    /// The file does not need to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every record, treating a missing, corrupt or unreadable file as empty
    ///
    /// Mutations are stricter: they only replace a corrupt file, never one
    /// that could not be read.
    pub async fn load(&self) -> TunnelMap {
        match self.read_store().await {
            Ok(map) => map,
            Err(e) => {
                warn!("{}; treating the registry as empty", e);
                TunnelMap::new()
            }
        }
    }

    /// Look up a single record
    pub async fn get(&self, name: &str) -> Option<TunnelRecord> {
        self.load().await.remove(name)
    }

    /// Insert a record, or update an existing one while keeping its description
    pub async fn upsert(&self, record: TunnelRecord) -> Result<UpsertOutcome> {
        if record.name.is_empty() {
            return Err(TunnelError::invalid_input("tunnel name must not be empty"));
        }
        if !record.links_consistent() {
            return Err(TunnelError::invalid_input(
                "public and access links must be set together",
            ));
        }

        let outcome = self
            .transact(|map| {
                let outcome = match map.get_mut(&record.name) {
                    Some(existing) => {
                        existing.local_target = record.local_target;
                        existing.public_link = record.public_link;
                        existing.access_link = record.access_link;
                        UpsertOutcome::Updated
                    }
                    None => {
                        map.insert(record.name.clone(), record);
                        UpsertOutcome::Created
                    }
                };
                (outcome, true)
            })
            .await?;

        debug!("Registry upsert: {:?}", outcome);
        Ok(outcome)
    }

    /// Register a new inactive tunnel; never overwrites
    pub async fn create(
        &self,
        name: &str,
        description: &str,
        local_target: &str,
    ) -> Result<CreateOutcome> {
        self.create_record(TunnelRecord::new(name, description, local_target))
            .await
    }

    /// Register a new inactive tunnel from a prepared record
    ///
    /// Any links on `record` are discarded.
    pub async fn create_record(&self, mut record: TunnelRecord) -> Result<CreateOutcome> {
        if record.name.trim().is_empty() {
            return Err(TunnelError::invalid_input("tunnel name must not be empty"));
        }
        if record.local_target.trim().is_empty() {
            return Err(TunnelError::invalid_input("local target must not be empty"));
        }
        record.clear_links();

        self.transact(|map| {
            if map.contains_key(&record.name) {
                (CreateOutcome::AlreadyExists, false)
            } else {
                info!("Registering tunnel {} -> {}", record.name, record.local_target);
                map.insert(record.name.clone(), record);
                (CreateOutcome::Created, true)
            }
        })
        .await
    }

    /// Clear the links of every record, returning how many were active
    ///
    /// Does not create the backing file when it is missing.
    pub async fn reset_all_links(&self) -> Result<usize> {
        let cleared = self
            .transact(|map| {
                let mut cleared = 0;
                for record in map.values_mut() {
                    if record.is_active() {
                        cleared += 1;
                    }
                    record.clear_links();
                }
                (cleared, !map.is_empty())
            })
            .await?;

        info!("Cleared links of {} previously active tunnel(s)", cleared);
        Ok(cleared)
    }

    /// Human-readable listing of all tunnels
    pub async fn render(&self) -> String {
        render_map(&self.load().await)
    }

    async fn transact<T, F>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut TunnelMap) -> (T, bool),
    {
        let _guard = self.write_lock.lock().await;
        let _store_lock = self.lock_store().await?;

        let mut map = match self.read_store().await {
            Ok(map) => map,
            Err(e @ TunnelError::StoreCorrupt { .. }) => {
                warn!("{}; it will be replaced on the next write", e);
                TunnelMap::new()
            }
            Err(e) => return Err(e),
        };
        let (out, changed) = apply(&mut map);
        if changed {
            self.persist(&map).await?;
        }

        Ok(out)
    }

    async fn read_store(&self) -> Result<TunnelMap> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No registry at {:?} yet", self.path);
                return Ok(TunnelMap::new());
            }
            Err(source) => {
                return Err(TunnelError::StoreReadFailed {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let raw = String::from_utf8(raw).map_err(|e| self.corrupt(e.to_string()))?;
        let mut map: TunnelMap =
            serde_json::from_str(&raw).map_err(|e| self.corrupt(e.to_string()))?;

        for (name, record) in map.iter_mut() {
            record.name = name.clone();
            if !record.links_consistent() {
                warn!("Tunnel {} has only one of its links set, marking inactive", name);
                record.clear_links();
            }
        }

        Ok(map)
    }

    /// Take the exclusive lock shared by every process using this registry
    ///
    /// The lock is held until the returned file is dropped.
    async fn lock_store(&self) -> Result<File> {
        let lock_path = self.lock_path();
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            create_parent_dir(&lock_path)?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|locked| locked)
        .map_err(|e| self.write_failed(e))?;

        Ok(file)
    }

    async fn persist(&self, map: &TunnelMap) -> Result<()> {
        let body = encode(map).map_err(|e| self.write_failed(e.into()))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || replace_file(&path, &body))
            .await
            .map_err(io::Error::other)
            .and_then(|written| written)
            .map_err(|e| self.write_failed(e))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_REGISTRY_PATH.into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn corrupt(&self, reason: String) -> TunnelError {
        TunnelError::StoreCorrupt {
            path: self.path.clone(),
            reason,
        }
    }

    fn write_failed(&self, source: io::Error) -> TunnelError {
        TunnelError::StoreWriteFailed {
            path: self.path.clone(),
            source,
        }
    }
}

fn create_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Write `body` to a uniquely named sibling, then rename it over `path`
///
/// Readers never see a partial file.
fn replace_file(path: &Path, body: &[u8]) -> io::Result<()> {
    create_parent_dir(path)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".flaretun-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// JSON with 4-space indentation, matching existing registry files
fn encode(map: &TunnelMap) -> serde_json::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    map.serialize(&mut serializer)?;
    Ok(buf)
}

/// Render a listing of the given records
pub fn render_map(map: &TunnelMap) -> String {
    if map.is_empty() {
        return "Eh? Why is there no tunnel... Please let the host know!".to_string();
    }

    let mut message = String::from("Okay~ Here's a list of existing tunnels:\n\n");
    for (name, record) in map {
        let status = if record.is_active() {
            format!("Active at {}", record.access_link)
        } else {
            "Inactive".to_string()
        };
        message.push_str(&format!(
            "**Name:** {}\n**Description:** {}\n**Status:** {}\n\n",
            name, record.description, status
        ));
    }
    message.push_str(
        "If any of these links don't work, use the `activate <name>` command.\n\
         If that doesn't work either, ping the host!",
    );

    message
}
