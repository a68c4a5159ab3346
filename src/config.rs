//! Durable user intent: desired feature states and the block list
//!
//! The coordinator treats these values as its checkpoint of what should be
//! true and replays them on startup and after system events.

use crate::core::blocklist::BlockList;
use crate::core::coordinator::Feature;
use crate::utils::get_data_dir;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PREFERENCES_FILE_NAME: &str = "preferences.json";

/// Persisted preferences
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub blocking_enabled: bool,
    #[serde(default)]
    pub grayscale_enabled: bool,
    /// Normalized, unique domains in insertion order
    #[serde(default)]
    pub blocked_domains: Vec<String>,
}

impl Preferences {
    pub fn desired(&self, feature: Feature) -> bool {
        match feature {
            Feature::Blocking => self.blocking_enabled,
            Feature::Grayscale => self.grayscale_enabled,
        }
    }

    pub fn set_desired(&mut self, feature: Feature, on: bool) {
        match feature {
            Feature::Blocking => self.blocking_enabled = on,
            Feature::Grayscale => self.grayscale_enabled = on,
        }
    }

    pub fn block_list(&self) -> BlockList {
        BlockList::new(&self.blocked_domains)
    }
}

/// Default location of the preferences file in the data directory.
pub fn default_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join(PREFERENCES_FILE_NAME))
}

/// Saves preferences to disk using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O to avoid blocking the event loop.
pub async fn save_preferences(path: &Path, prefs: &Preferences) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(prefs)?;
    let temp_path = path.with_extension("json.tmp");

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    // Create file with restrictive permissions from the start to prevent
    // race condition where file is briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?; // Ensure data is flushed to physical media
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    // Atomic rename
    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save preferences. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads preferences from disk, or returns defaults if missing or unreadable.
pub async fn load_preferences(path: &Path) -> Preferences {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt preferences at {}: {e}", path.display());
            Preferences::default()
        }),
        Err(_) => Preferences::default(),
    }
}

/// Source of durable user intent consumed by the coordinator
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn desired(&self, feature: Feature) -> bool;

    async fn set_desired(&self, feature: Feature, on: bool) -> std::io::Result<()>;

    async fn block_list(&self) -> BlockList;
}

/// File-backed [`PreferenceStore`] with an in-memory copy
pub struct JsonPreferences {
    path: PathBuf,
    cache: tokio::sync::Mutex<Preferences>,
}

impl JsonPreferences {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let prefs = load_preferences(&path).await;
        Self {
            path,
            cache: tokio::sync::Mutex::new(prefs),
        }
    }

    /// Preferences at [`default_path`].
    pub async fn open_default() -> std::io::Result<Self> {
        let path = default_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "Data directory not found")
        })?;
        Ok(Self::open(path).await)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Preferences {
        self.cache.lock().await.clone()
    }

    /// Applies `edit` and saves. The in-memory copy only changes if the save succeeds.
    pub async fn update<F>(&self, edit: F) -> std::io::Result<Preferences>
    where
        F: FnOnce(&mut Preferences) + Send,
    {
        let mut cache = self.cache.lock().await;
        let mut next = cache.clone();
        edit(&mut next);
        if next != *cache {
            save_preferences(&self.path, &next).await?;
            *cache = next.clone();
        }
        Ok(next)
    }
}

#[async_trait]
impl PreferenceStore for JsonPreferences {
    async fn desired(&self, feature: Feature) -> bool {
        self.cache.lock().await.desired(feature)
    }

    async fn set_desired(&self, feature: Feature, on: bool) -> std::io::Result<()> {
        self.update(|prefs| prefs.set_desired(feature, on))
            .await
            .map(|_| ())
    }

    async fn block_list(&self) -> BlockList {
        self.cache.lock().await.block_list()
    }
}
