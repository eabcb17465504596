//! Persistent registry of wrapped addons.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::{FetchMethod, WrappedAddon};

/// Errors from the addon registry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("addon {id} not found")]
    NotFound { id: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Thread-safe addon registry with JSON persistence.
///
/// Mutations persist to disk best-effort: a failed save is logged and the
/// in-memory state stays authoritative for the life of the process.
pub struct AddonStore {
    addons: RwLock<HashMap<String, WrappedAddon>>,
    file_path: PathBuf,
}

impl AddonStore {
    /// Opens the registry, loading any previously persisted state.
    /// A missing file means an empty registry.
    pub fn open(data_dir: &str) -> Result<Self, StoreError> {
        let file_path = PathBuf::from(data_dir).join("addons.json");

        let addons = match std::fs::read(&file_path) {
            Ok(data) => {
                serde_json::from_slice::<HashMap<String, WrappedAddon>>(&data).map_err(
                    |source| StoreError::Parse {
                        path: file_path.display().to_string(),
                        source,
                    },
                )?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: file_path.display().to_string(),
                    source,
                });
            }
        };

        if !addons.is_empty() {
            tracing::info!("addon store: loaded {} addons", addons.len());
        }

        Ok(Self {
            addons: RwLock::new(addons),
            file_path,
        })
    }

    /// Derives the 8-hex wrap ID from a manifest URL.
    pub fn wrap_id_for(original_url: &str) -> String {
        let digest = Sha256::digest(original_url.as_bytes());
        hex::encode(digest)[..8].to_string()
    }

    /// Registers an upstream addon. Idempotent: registering the same URL
    /// again returns the existing entry.
    pub async fn add(&self, original_url: &str) -> WrappedAddon {
        let id = Self::wrap_id_for(original_url);

        let mut addons = self.addons.write().await;
        if let Some(existing) = addons.get(&id) {
            return existing.clone();
        }

        let addon = WrappedAddon {
            id: id.clone(),
            original_url: original_url.to_string(),
            // Populated later once the manifest has been fetched.
            name: String::new(),
            fetch_method: FetchMethod::Global,
            fetch_status: Default::default(),
            created_at: Utc::now(),
        };
        addons.insert(id, addon.clone());
        drop(addons);

        self.save().await;
        addon
    }

    pub async fn get(&self, id: &str) -> Option<WrappedAddon> {
        self.addons.read().await.get(id).cloned()
    }

    /// All addons, sorted by creation time ascending.
    pub async fn list(&self) -> Vec<WrappedAddon> {
        let mut result: Vec<WrappedAddon> = self.addons.read().await.values().cloned().collect();
        result.sort_by_key(|addon| addon.created_at);
        result
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut addons = self.addons.write().await;
        if addons.remove(id).is_none() {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        drop(addons);

        self.save().await;
        Ok(())
    }

    /// Updates the display name. Name updates are monotonic in practice:
    /// callers only write a non-empty name over an empty one.
    pub async fn update_name(&self, id: &str, name: &str) -> Result<(), StoreError> {
        {
            let mut addons = self.addons.write().await;
            let addon = addons
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
            addon.name = name.to_string();
        }

        self.save().await;
        Ok(())
    }

    pub async fn update_fetch_method(
        &self,
        id: &str,
        method: FetchMethod,
    ) -> Result<(), StoreError> {
        {
            let mut addons = self.addons.write().await;
            let addon = addons
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
            addon.fetch_method = method;
        }

        self.save().await;
        Ok(())
    }

    /// Writes the registry to disk. Failures are logged, not propagated.
    async fn save(&self) {
        let snapshot = self.addons.read().await.clone();

        let data = match serde_json::to_vec_pretty(&snapshot) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!("addon store: serialize failed: {err}");
                return;
            }
        };

        if let Err(err) = tokio::fs::write(&self.file_path, data).await {
            tracing::error!(
                "addon store: writing {} failed: {err}",
                self.file_path.display()
            );
        }
    }
}
