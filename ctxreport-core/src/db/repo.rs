//! Database repository layer
//!
//! Sample rows are keyed by `(namespace, key_ms)`; every context source
//! reads and writes only its own namespace.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database connection lock poisoned".to_string()))
    }

    // ============================================
    // Sample operations
    // ============================================

    /// Number of samples buffered under a namespace
    pub fn count_samples(&self, namespace: &str) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE namespace = ?1",
            params![namespace],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// All sample keys under a namespace, ascending
    pub fn sample_keys(&self, namespace: &str) -> Result<Vec<i64>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT key_ms FROM samples WHERE namespace = ?1 ORDER BY key_ms")?;
        let keys = stmt
            .query_map(params![namespace], |r| r.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(keys)
    }

    /// Fetch one sample's JSON value
    pub fn get_sample(&self, namespace: &str, key_ms: i64) -> Result<Option<serde_json::Value>> {
        let conn = self.connection()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM samples WHERE namespace = ?1 AND key_ms = ?2",
                params![namespace, key_ms],
                |r| r.get(0),
            )
            .optional()?;

        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a sample
    pub fn put_sample(&self, namespace: &str, key_ms: i64, value: &serde_json::Value) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO samples (namespace, key_ms, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(namespace, key_ms) DO UPDATE SET
                value = excluded.value,
                stored_at = CURRENT_TIMESTAMP
            "#,
            params![namespace, key_ms, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    /// Delete a sample; deleting an absent key is not an error
    pub fn delete_sample(&self, namespace: &str, key_ms: i64) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM samples WHERE namespace = ?1 AND key_ms = ?2",
            params![namespace, key_ms],
        )?;
        Ok(())
    }

    /// Namespaces that currently hold samples, with their counts
    pub fn namespace_counts(&self) -> Result<Vec<(String, usize)>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, COUNT(*) FROM samples GROUP BY namespace ORDER BY namespace",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    #[test]
    fn test_put_get_overwrite() {
        let db = test_db();
        db.put_sample("ctx.sdk.network", 1_000, &json!({"state": -99}))
            .unwrap();
        db.put_sample("ctx.sdk.network", 1_000, &json!({"state": -1}))
            .unwrap();

        assert_eq!(db.count_samples("ctx.sdk.network").unwrap(), 1);
        assert_eq!(
            db.get_sample("ctx.sdk.network", 1_000).unwrap(),
            Some(json!({"state": -1}))
        );
        assert_eq!(db.get_sample("ctx.sdk.network", 2_000).unwrap(), None);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let db = test_db();
        db.put_sample("a", 1, &json!(1)).unwrap();
        db.put_sample("a", 2, &json!(2)).unwrap();
        db.put_sample("b", 1, &json!(3)).unwrap();

        assert_eq!(db.sample_keys("a").unwrap(), vec![1, 2]);
        assert_eq!(db.sample_keys("b").unwrap(), vec![1]);

        db.delete_sample("a", 1).unwrap();
        assert_eq!(db.count_samples("a").unwrap(), 1);
        assert_eq!(db.count_samples("b").unwrap(), 1);

        assert_eq!(
            db.namespace_counts().unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 1)]
        );
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let db = test_db();
        assert!(db.delete_sample("a", 42).is_ok());
    }

    #[test]
    fn test_open_on_disk_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/samples.db");
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        db.put_sample("a", 1, &json!({"x": 1})).unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        reopened.migrate().unwrap();
        assert_eq!(reopened.count_samples("a").unwrap(), 1);
    }
}
