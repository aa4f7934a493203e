use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on state file")]
    Io(#[from] std::io::Error),

    #[error("State serialization error")]
    Serde(#[from] serde_json::Error),
}

/// One JSON document under the data directory, keyed by section
/// (`"indexer_usage"`, `"provider_usage"`, ...). First boot starts empty.
#[derive(Debug)]
pub struct StateManager {
    path: PathBuf,
    doc: RwLock<Map<String, Value>>,
}

impl StateManager {
    pub async fn open(data_dir: &Path) -> Result<Self, StateError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join("state.json");

        let doc = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("State file {} is corrupt ({e}), starting fresh", path.display());
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded state from {} ({} sections)", path.display(), doc.len());
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let doc = self.doc.read().await;
        doc.get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateError> {
        let mut doc = self.doc.write().await;
        doc.insert(key.to_string(), serde_json::to_value(value)?);

        // Write-then-rename so a crash never leaves a torn document.
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(&*doc)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
