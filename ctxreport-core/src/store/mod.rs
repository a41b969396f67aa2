//! Sample stores
//!
//! Every context source owns one [`SampleStore`]: a timestamp-keyed buffer of
//! raw samples waiting to be reported. Two backends exist:
//!
//! - [`SqliteStore`]: durable, one namespace per source in a shared database
//! - [`MemoryStore`]: process-local, used when the database is unavailable

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;

/// Store key: collection time in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleKey(i64);

impl SampleKey {
    pub fn from_millis(ms: i64) -> Self {
        SampleKey(ms)
    }

    /// Key for the current wall-clock time
    pub fn now() -> Self {
        SampleKey(Utc::now().timestamp_millis())
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Whole seconds, rounded to nearest, as the collector expects
    pub fn as_unix_seconds(self) -> i64 {
        (self.0 as f64 / 1000.0).round() as i64
    }

    /// Time elapsed between this key and `now` (zero if `now` is earlier)
    pub fn age_at(self, now: SampleKey) -> Duration {
        let delta = now.0.saturating_sub(self.0);
        Duration::from_millis(delta.max(0) as u64)
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp-keyed persistence for one context source
///
/// All operations are asynchronous and may fail with a storage error.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Namespace this store is scoped to
    fn namespace(&self) -> &str;

    /// Whether samples survive a process restart
    fn is_durable(&self) -> bool;

    /// Number of buffered samples
    async fn count(&self) -> Result<usize>;

    /// Snapshot of buffered keys, in no particular order
    async fn keys(&self) -> Result<Vec<SampleKey>>;

    async fn get(&self, key: SampleKey) -> Result<Option<serde_json::Value>>;

    /// Store a value, overwriting any existing value under the same key
    async fn set(&self, key: SampleKey, value: serde_json::Value) -> Result<serde_json::Value>;

    /// Remove a value; removing an absent key succeeds
    async fn delete(&self, key: SampleKey) -> Result<()>;
}

/// Where source stores are created
#[derive(Clone)]
pub enum StoreBackend {
    Sqlite(Arc<Database>),
    /// In-memory by configuration
    Memory,
    /// In-memory because the database could not be opened
    Fallback,
}

impl StoreBackend {
    /// Open the configured backend, falling back to memory if SQLite is unusable
    pub fn open(config: &Config) -> Self {
        if config.storage.in_memory {
            return StoreBackend::Memory;
        }

        let path = config.database_path();
        match Database::open(&path).and_then(|db| db.migrate().map(|_| db)) {
            Ok(db) => {
                tracing::debug!(path = %path.display(), "Opened sample database");
                StoreBackend::Sqlite(Arc::new(db))
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Sample database unavailable, buffering in memory"
                );
                StoreBackend::Fallback
            }
        }
    }

    /// Create the store for one source namespace
    ///
    /// Fallback stores warn once per operation category on first use.
    pub fn store_for(&self, namespace: &str) -> Arc<dyn SampleStore> {
        match self {
            StoreBackend::Sqlite(db) => Arc::new(SqliteStore::new(Arc::clone(db), namespace)),
            StoreBackend::Memory => Arc::new(MemoryStore::new(namespace)),
            StoreBackend::Fallback => Arc::new(MemoryStore::fallback(namespace)),
        }
    }

    /// Durable database handle, if any
    pub fn database(&self) -> Option<&Arc<Database>> {
        match self {
            StoreBackend::Sqlite(db) => Some(db),
            StoreBackend::Memory | StoreBackend::Fallback => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_seconds_rounding() {
        assert_eq!(SampleKey::from_millis(1_499).as_unix_seconds(), 1);
        assert_eq!(SampleKey::from_millis(1_500).as_unix_seconds(), 2);
        assert_eq!(SampleKey::from_millis(1_700_000_000_123).as_unix_seconds(), 1_700_000_000);
    }

    #[test]
    fn test_key_age() {
        let key = SampleKey::from_millis(1_000);
        assert_eq!(key.age_at(SampleKey::from_millis(3_500)), Duration::from_millis(2_500));
        assert_eq!(key.age_at(SampleKey::from_millis(500)), Duration::ZERO);
    }

    #[test]
    fn test_keys_order_numerically() {
        let mut keys = vec![
            SampleKey::from_millis(10_000),
            SampleKey::from_millis(9_000),
            SampleKey::from_millis(100_000),
        ];
        keys.sort();
        assert_eq!(
            keys.iter().map(|k| k.as_millis()).collect::<Vec<_>>(),
            vec![9_000, 10_000, 100_000]
        );
    }

    #[tokio::test]
    async fn test_backend_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // Parent "directory" is a regular file, so the database cannot be created
        let not_a_dir = dir.path().join("occupied");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let blocked = not_a_dir.join("samples.db");

        let mut config = Config::default();
        config.storage.database_path = Some(blocked);

        let backend = StoreBackend::open(&config);
        assert!(matches!(backend, StoreBackend::Fallback));
        assert!(backend.database().is_none());

        let store = backend.store_for("ctx.sdk.network");
        assert!(!store.is_durable());
        store
            .set(SampleKey::from_millis(1), serde_json::json!({"state": -99}))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backend_opens_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.database_path = Some(dir.path().join("samples.db"));

        let backend = StoreBackend::open(&config);
        assert!(backend.database().is_some());
        assert!(backend.store_for("ctx.sdk.location").is_durable());
    }
}
