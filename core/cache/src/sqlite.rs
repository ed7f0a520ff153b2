//! SQLite cache backend for native runtimes.
//!
//! One table per collection holding the JSON document of each record, plus a
//! key-value `metadata` table for the hash snapshot and other scalars.

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use tripsync_common::{Collection, EntityId, Error, Result};

use crate::backend::CacheBackend;

const IN_MEMORY: &str = ":memory:";

/// Cache backend using an embedded SQLite database.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    /// Create a backend for the database file at `path`.
    ///
    /// Nothing is opened until [`CacheBackend::open`] is called.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Mutex::new(None),
        }
    }

    /// Create a backend on a private in-memory database (for testing).
    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or_else(|| {
            Error::ConnectionClosed(format!("{} is not open", self.path.display()))
        })?;
        let result = op(conn).map_err(map_sqlite_error);
        if matches!(result, Err(Error::ConnectionClosed(_))) {
            // Drop the handle so the next open() starts from the file again.
            guard.take();
            warn!("Discarded unusable SQLite connection to {}", self.path.display());
        }
        result
    }

    fn schema() -> String {
        let mut sql = String::new();
        for collection in Collection::ALL {
            sql.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY,
                    data TEXT NOT NULL
                );\n",
                collection.table_name()
            ));
        }
        sql.push_str(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        );
        sql
    }
}

fn map_sqlite_error(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
            Error::ConnectionClosed(err.to_string())
        }
        _ => Error::Storage(err.to_string()),
    }
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn open(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Ok(());
        }

        if self.path.as_os_str() != IN_MEMORY {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let conn = Connection::open(&self.path).map_err(map_sqlite_error)?;
        conn.execute_batch(&Self::schema()).map_err(map_sqlite_error)?;
        *guard = Some(conn);

        info!("SQLite cache opened at {}", self.path.display());
        Ok(())
    }

    async fn close(&self) {
        if self.lock().take().is_some() {
            debug!("SQLite cache closed");
        }
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<String>> {
        let sql = format!("SELECT data FROM {} ORDER BY id", collection.table_name());
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let data = rows.collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(data)
        })
    }

    async fn get(&self, collection: Collection, id: EntityId) -> Result<Option<String>> {
        let sql = format!("SELECT data FROM {} WHERE id = ?1", collection.table_name());
        self.with_conn(|conn| {
            conn.query_row(&sql, params![id], |row| row.get::<_, String>(0))
                .optional()
        })
    }

    async fn put_many(&self, collection: Collection, rows: Vec<(EntityId, String)>) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (id, data) VALUES (?1, ?2)",
            collection.table_name()
        );
        debug!("Upserting {} rows into {}", rows.len(), collection);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for (id, data) in &rows {
                    stmt.execute(params![id, data])?;
                }
            }
            tx.commit()
        })
    }

    async fn delete(&self, collection: Collection, id: EntityId) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", collection.table_name());
        self.with_conn(|conn| conn.execute(&sql, params![id]).map(|_| ()))
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        let sql = format!("DELETE FROM {}", collection.table_name());
        self.with_conn(|conn| conn.execute(&sql, []).map(|_| ()))
    }

    async fn set_meta(&self, key: &str, value: String) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
    }

    async fn clear_meta(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM metadata", []).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheStore;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_schema_and_round_trip() {
        let backend = SqliteBackend::in_memory();
        backend.open().await.unwrap();

        backend
            .put_many(
                Collection::Locations,
                vec![(2, r#"{"id":2}"#.to_string()), (1, r#"{"id":1}"#.to_string())],
            )
            .await
            .unwrap();

        let rows = backend.scan(Collection::Locations).await.unwrap();
        assert_eq!(rows, vec![r#"{"id":1}"#.to_string(), r#"{"id":2}"#.to_string()]);
        assert_eq!(
            backend.get(Collection::Locations, 2).await.unwrap(),
            Some(r#"{"id":2}"#.to_string())
        );
        assert!(backend.get(Collection::Locations, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_or_replace() {
        let backend = SqliteBackend::in_memory();
        backend.open().await.unwrap();

        backend
            .put_many(Collection::Trips, vec![(-1, "old".to_string())])
            .await
            .unwrap();
        backend
            .put_many(Collection::Trips, vec![(-1, "new".to_string())])
            .await
            .unwrap();

        assert_eq!(backend.scan(Collection::Trips).await.unwrap(), vec!["new".to_string()]);

        backend.delete(Collection::Trips, -1).await.unwrap();
        assert!(backend.scan(Collection::Trips).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata() {
        let backend = SqliteBackend::in_memory();
        backend.open().await.unwrap();

        backend.set_meta("hashSnapshot", "{}".to_string()).await.unwrap();
        assert_eq!(
            backend.get_meta("hashSnapshot").await.unwrap(),
            Some("{}".to_string())
        );

        backend.clear_meta().await.unwrap();
        assert!(backend.get_meta("hashSnapshot").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_connection_is_reported() {
        let backend = SqliteBackend::in_memory();
        let result = backend.scan(Collection::Trips).await;
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        let backend = SqliteBackend::new(&path);
        backend.open().await.unwrap();
        backend
            .put_many(Collection::Vehicles, vec![(7, r#"{"id":7}"#.to_string())])
            .await
            .unwrap();
        backend.close().await;

        let reopened = SqliteBackend::new(&path);
        reopened.open().await.unwrap();
        assert_eq!(reopened.scan(Collection::Vehicles).await.unwrap().len(), 1);
        assert_eq!(reopened.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_clear_collection_only() {
        let backend = SqliteBackend::in_memory();
        backend.open().await.unwrap();
        backend
            .put_many(Collection::Trips, vec![(1, "t".to_string())])
            .await
            .unwrap();
        backend
            .put_many(Collection::TripTypes, vec![(1, "tt".to_string())])
            .await
            .unwrap();

        backend.clear(Collection::Trips).await.unwrap();
        assert!(backend.scan(Collection::Trips).await.unwrap().is_empty());
        assert_eq!(backend.scan(Collection::TripTypes).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_reopens_after_database_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");

        let store = CacheStore::new(Arc::new(SqliteBackend::new(&path)));
        store
            .upsert_values(Collection::Vehicles, &[json!({"id": 1, "name": "Van"})])
            .await
            .unwrap();
        assert!(store.is_initialized());

        std::fs::write(&path, vec![0x42u8; 8192]).unwrap();
        assert!(store.get_all_values(Collection::Vehicles).await.is_empty());
        assert!(!store.is_initialized());

        let healthy = dir.path().join("healthy.db");
        let other = SqliteBackend::new(&healthy);
        other.open().await.unwrap();
        other
            .put_many(
                Collection::Vehicles,
                vec![(2, r#"{"id":2,"name":"Truck"}"#.to_string())],
            )
            .await
            .unwrap();
        other.close().await;
        std::fs::rename(&healthy, &path).unwrap();

        let rows = store.get_all_values(Collection::Vehicles).await;
        assert_eq!(rows, vec![json!({"id": 2, "name": "Truck"})]);
        assert!(store.is_initialized());
    }
}
