//! Persistent key/value storage for extension and page state.
//!
//! Models the host-provided atomic get/set store: whole-value reads and
//! writes per key, no cross-key transactions. The router persists a full
//! snapshot of the mutated value after every transition; rapid successive
//! statistics writes may interleave lost-update style across turns, which
//! is acceptable for best-effort telemetry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Storage keys shared by the router and the page client.
pub mod keys {
    pub const TARGETS: &str = "targets";
    pub const ACTIVE_TARGET_INDEX: &str = "activeTargetIndex";
    pub const TARGET_MODE: &str = "targetMode";
    pub const REQUEST_STATS: &str = "requestStats";
    pub const INTERCEPTOR_ENABLED: &str = "interceptorEnabled";
    pub const ENABLED_ENDPOINTS: &str = "enabledEndpoints";
}

/// Atomic whole-key JSON storage.
#[async_trait]
pub trait ExtensionStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Read a typed value from storage, `None` when the key is absent.
pub async fn load_typed<T: DeserializeOwned>(
    storage: &dyn ExtensionStorage,
    key: &str,
) -> Result<Option<T>> {
    match storage.get(key).await? {
        Some(value) => {
            let typed = serde_json::from_value(value)
                .with_context(|| format!("malformed stored value for key {key}"))?;
            Ok(Some(typed))
        }
        None => Ok(None),
    }
}

/// Write a typed value to storage.
pub async fn store_typed<T: Serialize>(
    storage: &dyn ExtensionStorage,
    key: &str,
    value: &T,
) -> Result<()> {
    storage.set(key, serde_json::to_value(value)?).await
}

/// In-memory storage for tests and page-local state.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExtensionStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON-file-backed storage for the long-lived router process.
///
/// The whole map is rewritten on every set; state is small (targets, flags,
/// bounded stats) so this stays cheap.
pub struct JsonFileStorage {
    path: PathBuf,
    cache: tokio::sync::Mutex<HashMap<String, Value>>,
}

impl JsonFileStorage {
    /// Open the store, loading any existing snapshot from disk. A missing
    /// file is an empty store; a corrupt file is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt state file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };
        Ok(Self {
            path,
            cache: tokio::sync::Mutex::new(cache),
        })
    }

    async fn flush(&self, cache: &HashMap<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(cache)?;
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("cannot write {}", self.path.display()))
    }
}

#[async_trait]
impl ExtensionStorage for JsonFileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.cache.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.insert(key.to_string(), value);
        self.flush(&cache).await
    }
}
