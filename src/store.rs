//! Small key-value state that survives restarts: who is logged in and the
//! receiver names the driver typed recently.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::order::DriverId;
use crate::sync::recent::RecentList;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    driver_id: Option<DriverId>,
    #[serde(default)]
    recent_receivers: Vec<String>,
}

struct StoreState {
    driver_id: Option<DriverId>,
    recent_receivers: RecentList<String>,
}

pub struct LocalStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl LocalStore {
    /// Opens the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl AsRef<Path>, receivers_limit: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let persisted = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "discarding unreadable store");
                Persisted::default()
            }),
            Err(_) => Persisted::default(),
        };

        Self::from_persisted(Some(path), persisted, receivers_limit)
    }

    pub fn in_memory(receivers_limit: usize) -> Self {
        Self::from_persisted(None, Persisted::default(), receivers_limit)
    }

    fn from_persisted(path: Option<PathBuf>, persisted: Persisted, receivers_limit: usize) -> Self {
        let mut recent_receivers = RecentList::new(receivers_limit);
        for name in persisted.recent_receivers.into_iter().rev() {
            recent_receivers.push(name);
        }

        Self {
            path,
            state: Mutex::new(StoreState {
                driver_id: persisted.driver_id,
                recent_receivers,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn driver_id(&self) -> Option<DriverId> {
        self.state().driver_id
    }

    pub fn set_driver_id(&self, driver_id: Option<DriverId>) -> Result<(), StoreError> {
        self.state().driver_id = driver_id;
        self.save()
    }

    pub fn recent_receivers(&self) -> Vec<String> {
        self.state().recent_receivers.to_vec()
    }

    pub fn remember_receiver(&self, name: &str) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }
        self.state().recent_receivers.push(name.to_string());
        self.save()
    }

    fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let encoded = {
            let state = self.state();
            serde_json::to_string_pretty(&Persisted {
                driver_id: state.driver_id,
                recent_receivers: state.recent_receivers.to_vec(),
            })?
        };

        let staging = path.with_extension("tmp");
        fs::write(&staging, encoded)
            .and_then(|()| fs::rename(&staging, path))
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;

        debug!(path = %path.display(), "store saved");
        Ok(())
    }
}
