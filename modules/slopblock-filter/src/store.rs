// Persisted key-value store.
//
// KeyValueStore is the seam over the host's storage (synced across devices
// or local-only). MemoryStore backs tests and the CLI; FileStore keeps one
// JSON document per area on disk. Settings wraps any store so that a failed
// read is "value unavailable" and a failed write is logged, never fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use slopblock_common::{FilterMode, SlopBlockError};

/// Which storage area a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreArea {
    /// Follows the user across devices.
    Synced,
    /// This device only.
    Local,
}

impl StoreArea {
    fn file_name(&self) -> &'static str {
        match self {
            StoreArea::Synced => "synced.json",
            StoreArea::Local => "local.json",
        }
    }
}

/// Persisted key names. These match what the settings UI writes.
pub mod keys {
    pub const ENABLED: &str = "slopBlockEnabled";
    pub const FILTER_MODE: &str = "filterMode";
    pub const ALLOW_LIST: &str = "userWhitelist";
    pub const BLOCKED_KEYWORDS: &str = "blockedKeywords";
    pub const REMOTE_ENABLED: &str = "aiDetectionEnabled";
    pub const SYSTEM_PROMPT: &str = "systemPrompt";
    pub const BATCH_SIZE: &str = "batchSize";
    pub const DETECTION_COUNT: &str = "detectionCount";
    pub const SEEN_IDS: &str = "processedTweetIds";
    pub const COLLAPSED_IDS: &str = "collapsedTweetIds";
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a content quality filter for a social media feed. \
Flag posts that read as low-effort engagement farming or machine-generated filler: \
generic motivational narratives, get-rich-quick or course sales pitches, \
\"like if you agree\" style bait, formulaic numbered lists and threads, \
and text that identifies itself as AI-written. \
Do not flag genuine personal updates, news, jokes, questions or niche discussion \
just because they are short, informal or opinionated.";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, area: StoreArea, key: &str) -> Result<Option<Value>>;

    async fn set(&self, area: StoreArea, key: &str, value: Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<(StoreArea, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one key, for assertions.
    pub fn peek(&self, area: StoreArea, key: &str) -> Option<Value> {
        self.lock().get(&(area, key.to_string())).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(StoreArea, String), Value>> {
        self.values.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, area: StoreArea, key: &str) -> Result<Option<Value>> {
        Ok(self.peek(area, key))
    }

    async fn set(&self, area: StoreArea, key: &str, value: Value) -> Result<()> {
        self.lock().insert((area, key.to_string()), value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// One JSON object per area under `dir`. Writes replace the file atomically
/// (temp file + rename).
pub struct FileStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path(&self, area: StoreArea) -> PathBuf {
        self.dir.join(area.file_name())
    }

    async fn read_area(&self, path: &Path) -> Result<Map<String, Value>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(SlopBlockError::Store(format!("read {}: {e}", path.display())).into())
            }
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(SlopBlockError::Store(format!(
                "{} does not hold a JSON object",
                path.display()
            ))
            .into()),
            Err(e) => {
                Err(SlopBlockError::Store(format!("parse {}: {e}", path.display())).into())
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, area: StoreArea, key: &str) -> Result<Option<Value>> {
        let map = self.read_area(&self.path(area)).await?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, area: StoreArea, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(area);
        let mut map = self.read_area(&path).await?;
        map.insert(key.to_string(), value);

        let body = serde_json::to_vec_pretty(&Value::Object(map))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| SlopBlockError::Store(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SlopBlockError::Store(format!("rename {}: {e}", path.display())))?;
        debug!(key, file = %path.display(), "Store write");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Typed, failure-tolerant access to a [`KeyValueStore`].
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn KeyValueStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Read `key`, falling back to `default` when the key is absent, the
    /// store fails, or the stored value has the wrong shape.
    pub async fn get_or<T: DeserializeOwned>(&self, area: StoreArea, key: &str, default: T) -> T {
        match self.store.get(area, key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(key, error = %e, "Stored value has unexpected shape, using default");
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                warn!(key, error = %e, "Store read failed, using default");
                default
            }
        }
    }

    /// Write `key`. Returns false (after logging) when the write failed.
    pub async fn set<T: Serialize>(&self, area: StoreArea, key: &str, value: &T) -> bool {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize setting");
                return false;
            }
        };
        match self.store.set(area, key, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Store write failed");
                false
            }
        }
    }

    /// Load every user-facing setting in one go.
    pub async fn load_filter_settings(&self, default_batch_size: usize) -> FilterSettings {
        FilterSettings {
            enabled: self.get_or(StoreArea::Synced, keys::ENABLED, false).await,
            mode: self
                .get_or(StoreArea::Synced, keys::FILTER_MODE, FilterMode::default())
                .await,
            allow_list: self.get_or(StoreArea::Synced, keys::ALLOW_LIST, Vec::new()).await,
            blocked_keywords: self
                .get_or(StoreArea::Synced, keys::BLOCKED_KEYWORDS, Vec::new())
                .await,
            remote_enabled: self.get_or(StoreArea::Synced, keys::REMOTE_ENABLED, false).await,
            system_prompt: self
                .get_or(
                    StoreArea::Synced,
                    keys::SYSTEM_PROMPT,
                    DEFAULT_SYSTEM_PROMPT.to_string(),
                )
                .await,
            batch_size: self
                .get_or(StoreArea::Synced, keys::BATCH_SIZE, default_batch_size)
                .await
                .max(1),
            detection_count: self.get_or(StoreArea::Synced, keys::DETECTION_COUNT, 0u64).await,
        }
    }
}

/// User settings as persisted by the settings UI.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSettings {
    pub enabled: bool,
    pub mode: FilterMode,
    pub allow_list: Vec<String>,
    pub blocked_keywords: Vec<String>,
    pub remote_enabled: bool,
    pub system_prompt: String,
    pub batch_size: usize,
    pub detection_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingStore;
    use serde_json::json;

    #[tokio::test]
    async fn defaults_when_store_is_empty() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        let loaded = settings.load_filter_settings(10).await;
        assert!(!loaded.enabled);
        assert_eq!(loaded.mode, FilterMode::Collapse);
        assert!(loaded.allow_list.is_empty());
        assert_eq!(loaded.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(loaded.batch_size, 10);
    }

    #[tokio::test]
    async fn failing_store_reads_as_defaults_and_writes_report_false() {
        let settings = Settings::new(Arc::new(FailingStore));
        assert!(settings.get_or(StoreArea::Synced, keys::ENABLED, true).await);
        assert!(!settings.set(StoreArea::Synced, keys::ENABLED, &false).await);
    }

    #[tokio::test]
    async fn wrong_shape_falls_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(StoreArea::Synced, keys::BATCH_SIZE, json!("lots"))
            .await
            .unwrap();
        let settings = Settings::new(store);
        assert_eq!(settings.get_or(StoreArea::Synced, keys::BATCH_SIZE, 10usize).await, 10);
    }

    #[tokio::test]
    async fn areas_are_separate() {
        let store = MemoryStore::new();
        store.set(StoreArea::Local, "k", json!(1)).await.unwrap();
        assert_eq!(store.get(StoreArea::Synced, "k").await.unwrap(), None);
        assert_eq!(store.get(StoreArea::Local, "k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store
                .set(StoreArea::Local, keys::SEEN_IDS, json!(["1", "2"]))
                .await
                .unwrap();
            store
                .set(StoreArea::Synced, keys::FILTER_MODE, json!("blur"))
                .await
                .unwrap();
        }

        let reopened = Arc::new(FileStore::open(dir.path()).unwrap());
        assert_eq!(
            reopened.get(StoreArea::Local, keys::SEEN_IDS).await.unwrap(),
            Some(json!(["1", "2"]))
        );
        let settings = Settings::new(reopened);
        assert_eq!(settings.load_filter_settings(10).await.mode, FilterMode::Blur);
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("local.json"), "not json").unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.get(StoreArea::Local, "anything").await.is_err());
    }
}
