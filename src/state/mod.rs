//! Persisted pipeline state
//!
//! Each composition request advances through its pipeline one step at a time;
//! what the steps produced so far is kept in a [`StateStore`] keyed by the
//! request key (`namespace/name`).
//!
//! ## Directory Locations
//!
//! **macOS:**
//! - `~/Library/Application Support/wacpack/` (dirs::data_local_dir)
//!
//! **Linux/Unix:**
//! - `$XDG_STATE_HOME/wacpack/` (if XDG_STATE_HOME is set)
//! - `~/.local/state/wacpack/` (default fallback)
//!
//! **Other platforms:**
//! - `dirs::data_local_dir()/wacpack/state/`

use crate::status::ComponentStatus;
use crate::trace::ComponentSpan;
use crate::types::{Reference, ResolvedComponent, base64_bytes};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

/// Get the state directory for wacpack
pub fn get_state_dir() -> Result<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        Ok(dirs::data_local_dir()
            .context("Failed to get data local directory")?
            .join("wacpack"))
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        // dirs has no state_dir on every platform, so follow XDG by hand
        if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
            Ok(PathBuf::from(xdg_state).join("wacpack"))
        } else {
            Ok(dirs::home_dir()
                .context("Failed to get home directory")?
                .join(".local")
                .join("state")
                .join("wacpack"))
        }
    }

    #[cfg(not(unix))]
    {
        Ok(dirs::data_local_dir()
            .context("Failed to get data local directory")?
            .join("wacpack")
            .join("state"))
    }
}

/// Ensure the state directory exists, creating it if necessary
pub fn ensure_state_dir() -> Result<PathBuf> {
    let state_dir = get_state_dir()?;
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create state directory: {}", state_dir.display()))?;
    Ok(state_dir)
}

/// Where a request is in its pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Resolving,
    Composing,
    Packaging,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub generation: i64,
    pub phase: Phase,
    /// Index of the next dependency to resolve
    pub cursor: usize,
    #[serde(default)]
    pub resolved: Vec<ResolvedComponent>,
    #[serde(default)]
    pub trace: Vec<ComponentSpan>,
    #[serde(default, with = "base64_bytes::option", skip_serializing_if = "Option::is_none")]
    pub composed: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Reference>,
    #[serde(default)]
    pub status: ComponentStatus,
}

impl PipelineState {
    pub fn new(generation: i64) -> Self {
        PipelineState {
            generation,
            ..Default::default()
        }
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("invalid state key '{0}'")]
    InvalidKey(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<PipelineState>, StateError>;
    async fn save(&self, key: &str, state: &PipelineState) -> Result<(), StateError>;
    async fn remove(&self, key: &str) -> Result<(), StateError>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, PipelineState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<PipelineState>, StateError> {
        Ok(self.states.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, state: &PipelineState) -> Result<(), StateError> {
        self.states
            .lock()
            .await
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StateError> {
        self.states.lock().await.remove(key);
        Ok(())
    }
}

/// One JSON document per request: `<root>/<namespace>/<name>.json`
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStateStore { root: root.into() }
    }

    /// Store under `<state dir>/pipelines`
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(ensure_state_dir()?.join("pipelines")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf, StateError> {
        let segments: Vec<&str> = key.split('/').collect();
        let valid = segments
            .iter()
            .all(|s| !s.is_empty() && *s != "." && *s != ".." && !s.contains('\\'));
        if !valid {
            return Err(StateError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        path.extend(&segments);
        path.set_extension("json");
        Ok(path)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &str) -> Result<Option<PipelineState>, StateError> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StateError::Json { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    async fn save(&self, key: &str, state: &PipelineState) -> Result<(), StateError> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StateError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| StateError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| StateError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StateError::Io { path, source })
    }

    async fn remove(&self, key: &str) -> Result<(), StateError> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }
}
