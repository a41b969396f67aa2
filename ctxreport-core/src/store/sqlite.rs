//! SQLite-backed sample store

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::Database;
use crate::error::{Error, Result};

use super::{SampleKey, SampleStore};

/// Durable store scoped to one namespace of a shared [`Database`]
pub struct SqliteStore {
    db: Arc<Database>,
    namespace: Arc<str>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>, namespace: &str) -> Self {
        Self {
            db,
            namespace: Arc::from(namespace),
        }
    }

    /// Run a blocking database call off the async executor
    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &str) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let namespace = Arc::clone(&self.namespace);
        tokio::task::spawn_blocking(move || f(&db, &namespace))
            .await
            .map_err(|e| Error::Storage(format!("sample store task failed: {}", e)))?
    }
}

#[async_trait]
impl SampleStore for SqliteStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn count(&self) -> Result<usize> {
        self.with_db(|db, ns| db.count_samples(ns)).await
    }

    async fn keys(&self) -> Result<Vec<SampleKey>> {
        let keys = self.with_db(|db, ns| db.sample_keys(ns)).await?;
        Ok(keys.into_iter().map(SampleKey::from_millis).collect())
    }

    async fn get(&self, key: SampleKey) -> Result<Option<serde_json::Value>> {
        self.with_db(move |db, ns| db.get_sample(ns, key.as_millis()))
            .await
    }

    async fn set(&self, key: SampleKey, value: serde_json::Value) -> Result<serde_json::Value> {
        self.with_db(move |db, ns| {
            db.put_sample(ns, key.as_millis(), &value)?;
            Ok(value)
        })
        .await
    }

    async fn delete(&self, key: SampleKey) -> Result<()> {
        self.with_db(move |db, ns| db.delete_sample(ns, key.as_millis()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared_db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let store = SqliteStore::new(shared_db(), "ctx.sdk.network");
        let key = SampleKey::from_millis(1_700_000_000_000);

        store.set(key, json!({"state": -99})).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.keys().await.unwrap(), vec![key]);
        assert_eq!(store.get(key).await.unwrap(), Some(json!({"state": -99})));

        store.delete(key).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stores_sharing_a_database_stay_separate() {
        let db = shared_db();
        let network = SqliteStore::new(Arc::clone(&db), "ctx.sdk.network");
        let location = SqliteStore::new(db, "ctx.sdk.location");

        network
            .set(SampleKey::from_millis(1), json!({"state": -1}))
            .await
            .unwrap();
        assert_eq!(network.count().await.unwrap(), 1);
        assert_eq!(location.count().await.unwrap(), 0);
        assert_eq!(location.get(SampleKey::from_millis(1)).await.unwrap(), None);
    }
}
