//! Durable state.
//!
//! Layout under the data directory:
//!
//! ```text
//! state.json             PersistedState (nodes + categories)
//! positions.json         node id -> position
//! buffers/<session>.json output history of one session
//! ```
//!
//! Every file is rewritten wholesale through a temp file and a rename, so a
//! crash never leaves a torn document behind. Writers take [`Store::lock`]
//! before snapshotting what they are about to write; that keeps an older
//! snapshot from landing after a newer one.

use crate::protocol::{Category, OutputChunk, Position};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt document {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("unsafe session id for a file name: {0:?}")]
    InvalidId(String),
}

/// Durable shadow of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    pub session_id: String,
    pub node_id: String,
    pub agent_kind: String,
    pub label: String,
    #[serde(default)]
    pub command: Option<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub branch: Option<String>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// Everything in `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    /// Keyed by session id.
    #[serde(default)]
    pub nodes: BTreeMap<String, PersistedNode>,
    /// Keyed by category id.
    #[serde(default)]
    pub categories: BTreeMap<String, Category>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            nodes: BTreeMap::new(),
            categories: BTreeMap::new(),
        }
    }
}

/// File-backed store rooted at a data directory.
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize writers. Hold the guard from snapshot to write.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    #[must_use]
    pub fn positions_path(&self) -> PathBuf {
        self.dir.join("positions.json")
    }

    pub fn buffer_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let safe = !session_id.is_empty()
            && !session_id.starts_with('.')
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !safe {
            return Err(StoreError::InvalidId(session_id.to_string()));
        }
        Ok(self.dir.join("buffers").join(format!("{session_id}.json")))
    }

    /// Load `state.json`; a missing file is an empty state.
    pub async fn load_state(&self) -> Result<PersistedState, StoreError> {
        Ok(read_json(&self.state_path()).await?.unwrap_or_default())
    }

    pub async fn save_state(&self, state: &PersistedState) -> Result<(), StoreError> {
        write_json(&self.state_path(), state).await
    }

    /// Load `positions.json`; a missing file means no positions.
    pub async fn load_positions(&self) -> Result<HashMap<String, Position>, StoreError> {
        Ok(read_json(&self.positions_path()).await?.unwrap_or_default())
    }

    pub async fn save_positions(&self, positions: &HashMap<String, Position>) -> Result<(), StoreError> {
        let sorted: BTreeMap<_, _> = positions.iter().collect();
        write_json(&self.positions_path(), &sorted).await
    }

    /// Load one session's output history; missing means empty.
    pub async fn load_buffer(&self, session_id: &str) -> Result<Vec<OutputChunk>, StoreError> {
        Ok(read_json(&self.buffer_path(session_id)?).await?.unwrap_or_default())
    }

    pub async fn save_buffer(&self, session_id: &str, chunks: &[OutputChunk]) -> Result<(), StoreError> {
        write_json(&self.buffer_path(session_id)?, &chunks).await
    }

    pub async fn remove_buffer(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.buffer_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Atomic JSON write: write to a temp file then rename.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let file_name = path
        .file_name()
        .map_or_else(|| "state".into(), |n| n.to_string_lossy().into_owned());
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    tokio::fs::write(&tmp_path, &json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)
}
