//! Token relay: capability tokens for the remote-desktop relay service.
//!
//! The relay service polls a text file with one `<token>: <host>:<port>` line
//! per active token. Every mutation rewrites the whole file through a temp
//! file and rename while holding the relay lock, so the service never reads a
//! partial file and two writers never interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::RelayError;

/// Where one token leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub task_id: String,
    pub host: String,
    pub port: u16,
}

/// Owner of the relay token file.
pub struct TokenRelay {
    path: PathBuf,
    host: String,
    port: u16,
    entries: Mutex<HashMap<String, RelayEntry>>,
}

impl TokenRelay {
    /// Tokens minted by this relay point at `host:port`.
    pub fn new(path: impl Into<PathBuf>, host: impl Into<String>, port: u16) -> Self {
        Self {
            path: path.into(),
            host: host.into(),
            port,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue a fresh token for `task_id`. Existing tokens for the task stay valid.
    pub async fn mint(&self, task_id: &str) -> Result<String, RelayError> {
        let token = generate_token();
        self.register(&token, task_id).await?;
        debug!(task_id = %task_id, "Relay token minted");
        Ok(token)
    }

    /// Re-publish a token that already exists, e.g. after a restart.
    pub async fn register(&self, token: &str, task_id: &str) -> Result<(), RelayError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            token.to_string(),
            RelayEntry {
                task_id: task_id.to_string(),
                host: self.host.clone(),
                port: self.port,
            },
        );
        self.publish(&entries).await
    }

    /// Drop every token belonging to `task_id`. Returns how many were removed.
    ///
    /// The file is left alone when the task had no tokens.
    pub async fn revoke(&self, task_id: &str) -> Result<usize, RelayError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.task_id != task_id);
        let removed = before - entries.len();
        if removed == 0 {
            return Ok(0);
        }
        self.publish(&entries).await?;
        info!(task_id = %task_id, removed, "Relay tokens revoked");
        Ok(removed)
    }

    /// Rewrite the file from the in-memory set. At startup this clears
    /// tokens left behind by a previous process.
    pub async fn sync(&self) -> Result<(), RelayError> {
        let entries = self.entries.lock().await;
        self.publish(&entries).await
    }

    /// Tokens currently published for `task_id`.
    pub async fn tokens_for(&self, task_id: &str) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut tokens: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.task_id == task_id)
            .map(|(t, _)| t.clone())
            .collect();
        tokens.sort();
        tokens
    }

    pub async fn lookup(&self, token: &str) -> Option<RelayEntry> {
        self.entries.lock().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Rewrite the file. Called with the entries lock held.
    async fn publish(&self, entries: &HashMap<String, RelayEntry>) -> Result<(), RelayError> {
        let body = render(entries);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .map_err(|e| RelayError::Write {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?
            .map_err(|e| RelayError::Write {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Render the file body, sorted by token.
pub fn render(entries: &HashMap<String, RelayEntry>) -> String {
    let mut lines: Vec<(&String, &RelayEntry)> = entries.iter().collect();
    lines.sort_by(|a, b| a.0.cmp(b.0));
    lines
        .into_iter()
        .map(|(token, e)| format!("{token}: {}:{}\n", e.host, e.port))
        .collect()
}

/// 24 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn write_atomic(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}
