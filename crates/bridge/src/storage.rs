//! Persisted bridge state
//!
//! Survives restarts: the last applied configuration blob and the flags
//! feeding the driver-health advisory.

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Last configuration blob accepted by `configure`
    pub saved_configuration: Option<String>,
    /// First run since installation, cleared by the first successful call
    pub after_install: bool,
    /// Device access failed in a way pointing at missing udev rules
    pub driver_problem_suspected: bool,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState>;
    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// JSON file store
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    /// A missing file means a fresh installation
    fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            debug!("No state file at {}, assuming fresh install", self.path.display());
            return Ok(PersistedState {
                after_install: true,
                ..Default::default()
            });
        }

        let content = fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| Error::Storage(format!("Failed to serialize state: {}", e)))?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStateStore {
    state: std::sync::Mutex<PersistedState>,
}

impl MemoryStateStore {
    pub fn new(state: PersistedState) -> Self {
        Self {
            state: std::sync::Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<PersistedState> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| Error::Storage("state lock poisoned".into()))
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let mut current = self
            .state
            .lock()
            .map_err(|_| Error::Storage("state lock poisoned".into()))?;
        *current = state.clone();
        Ok(())
    }
}

/// Cached state written through to a store on change
pub struct SharedState {
    store: Arc<dyn StateStore>,
    state: Mutex<PersistedState>,
}

impl SharedState {
    /// Load from `store`; an unreadable store starts from defaults
    pub fn load(store: Arc<dyn StateStore>) -> Self {
        let state = store.load().unwrap_or_else(|e| {
            warn!("Failed to load persisted state: {}, using defaults", e);
            PersistedState::default()
        });
        Self {
            store,
            state: Mutex::new(state),
        }
    }

    pub async fn get(&self) -> PersistedState {
        self.state.lock().await.clone()
    }

    /// Apply `change`, saving only when something differs
    pub async fn update(&self, change: impl FnOnce(&mut PersistedState)) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut updated = state.clone();
        change(&mut updated);
        if updated == *state {
            return Ok(());
        }
        self.store.save(&updated)?;
        *state = updated;
        Ok(())
    }
}
