//! IndexedDB cache backend for the browser runtime.
//!
//! ## Storage Schema
//!
//! - One object store per collection (`trips`, `locations`, `trip_types`,
//!   `vehicles`, `vehicle_types`) keyed by numeric id, values are JSON strings
//! - `metadata`: JSON strings keyed by name

use async_trait::async_trait;
use indexed_db::{Database, Factory};
use js_sys::JsString;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{info, warn};
use wasm_bindgen::{JsCast, JsValue};

use tripsync_common::{Collection, EntityId, Error, Result};

use crate::backend::CacheBackend;

const DB_VERSION: u32 = 1;
const STORE_METADATA: &str = "metadata";

type IdbError = std::io::Error;

/// Cache backend backed by the browser's IndexedDB.
pub struct IndexedDbBackend {
    name: String,
    db: RefCell<Option<Rc<Database<IdbError>>>>,
}

impl IndexedDbBackend {
    /// Create a backend for the named database. Nothing is opened yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db: RefCell::new(None),
        }
    }

    /// Whether the current global scope exposes an IndexedDB factory.
    pub fn is_supported() -> bool {
        Factory::<IdbError>::get().is_ok()
    }

    fn database(&self) -> Result<Rc<Database<IdbError>>> {
        self.db
            .borrow()
            .clone()
            .ok_or_else(|| Error::ConnectionClosed(format!("{} is not open", self.name)))
    }

    fn map_error(&self, err: indexed_db::Error<IdbError>) -> Error {
        let message = format!("{:?}", err);
        if message.contains("Closed") || message.contains("InvalidState") {
            self.db.borrow_mut().take();
            Error::ConnectionClosed(message)
        } else {
            Error::Storage(message)
        }
    }
}

fn entity_key(id: EntityId) -> JsValue {
    JsValue::from_f64(id as f64)
}

#[async_trait(?Send)]
impl CacheBackend for IndexedDbBackend {
    fn name(&self) -> &str {
        "indexeddb"
    }

    async fn open(&self) -> Result<()> {
        if self.db.borrow().is_some() {
            return Ok(());
        }

        let factory = Factory::<IdbError>::get()
            .map_err(|e| Error::Storage(format!("IndexedDB factory unavailable: {:?}", e)))?;

        let db = factory
            .open(&self.name, DB_VERSION, |evt| async move {
                let db = evt.database();
                let existing = db.object_store_names();

                for collection in Collection::ALL {
                    let store = collection.table_name();
                    if !existing.contains(&store.to_string()) {
                        db.build_object_store(store).create()?;
                    }
                }
                if !existing.contains(&STORE_METADATA.to_string()) {
                    db.build_object_store(STORE_METADATA).create()?;
                }

                Ok(())
            })
            .await
            .map_err(|e| Error::Storage(format!("Failed to open IndexedDB: {:?}", e)))?;

        *self.db.borrow_mut() = Some(Rc::new(db));
        info!("IndexedDB cache '{}' opened", self.name);
        Ok(())
    }

    async fn close(&self) {
        self.db.borrow_mut().take();
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<String>> {
        let db = self.database()?;
        let store_name = collection.table_name();

        db.transaction(&[store_name])
            .run(move |t| async move {
                let store = t.object_store(store_name)?;
                let mut cursor = store.cursor().open().await?;
                let mut keys = Vec::new();
                while let Some(key) = cursor.key() {
                    keys.push(key);
                    cursor.advance(1).await?;
                }

                let mut rows = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(value) = store.get(&key).await? {
                        match value.dyn_ref::<JsString>() {
                            Some(s) => rows.push(String::from(s)),
                            None => warn!("Skipping non-string row in {}", store_name),
                        }
                    }
                }
                Ok(rows)
            })
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn get(&self, collection: Collection, id: EntityId) -> Result<Option<String>> {
        let db = self.database()?;
        let store_name = collection.table_name();

        db.transaction(&[store_name])
            .run(move |t| async move {
                let store = t.object_store(store_name)?;
                let value = store.get(&entity_key(id)).await?;
                Ok(value.and_then(|v| v.dyn_ref::<JsString>().map(String::from)))
            })
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn put_many(&self, collection: Collection, rows: Vec<(EntityId, String)>) -> Result<()> {
        let db = self.database()?;
        let store_name = collection.table_name();

        db.transaction(&[store_name])
            .rw()
            .run(move |t| async move {
                let store = t.object_store(store_name)?;
                for (id, data) in rows {
                    store
                        .put_kv(&entity_key(id), &JsString::from(data.as_str()))
                        .await?;
                }
                Ok(())
            })
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn delete(&self, collection: Collection, id: EntityId) -> Result<()> {
        let db = self.database()?;
        let store_name = collection.table_name();

        db.transaction(&[store_name])
            .rw()
            .run(move |t| async move {
                let store = t.object_store(store_name)?;
                store.delete(&entity_key(id)).await?;
                Ok(())
            })
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        let db = self.database()?;
        clear_store(&db, collection.table_name())
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn set_meta(&self, key: &str, value: String) -> Result<()> {
        let db = self.database()?;
        let key = key.to_string();

        db.transaction(&[STORE_METADATA])
            .rw()
            .run(move |t| async move {
                let store = t.object_store(STORE_METADATA)?;
                store
                    .put_kv(
                        &JsString::from(key.as_str()),
                        &JsString::from(value.as_str()),
                    )
                    .await?;
                Ok(())
            })
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let db = self.database()?;
        let key = key.to_string();

        db.transaction(&[STORE_METADATA])
            .run(move |t| async move {
                let store = t.object_store(STORE_METADATA)?;
                let value = store.get(&JsString::from(key.as_str())).await?;
                Ok(value.and_then(|v| v.dyn_ref::<JsString>().map(String::from)))
            })
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn clear_meta(&self) -> Result<()> {
        let db = self.database()?;
        clear_store(&db, STORE_METADATA)
            .await
            .map_err(|e| self.map_error(e))
    }
}

async fn clear_store(
    db: &Database<IdbError>,
    store_name: &'static str,
) -> std::result::Result<(), indexed_db::Error<IdbError>> {
    db.transaction(&[store_name])
        .rw()
        .run(move |t| async move {
            let store = t.object_store(store_name)?;
            let mut cursor = store.cursor().open().await?;
            let mut keys = Vec::new();
            while let Some(key) = cursor.key() {
                keys.push(key);
                cursor.advance(1).await?;
            }
            for key in keys {
                store.delete(&key).await?;
            }
            Ok(())
        })
        .await
}
