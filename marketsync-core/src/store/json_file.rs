//! Document store persisted as one JSON file per collection.
//!
//! Layout: `{data_dir}/{collection}.json` holds a JSON array of documents,
//! `{collection}.meta.json` the row count, content hash and write time.
//!
//! - Writes are atomic (write to .tmp, rename into place)
//! - Collections are loaded lazily and kept in memory afterwards
//! - A file that fails to parse is quarantined (`.json.quarantined`) and the
//!   collection starts empty

use chrono::NaiveDateTime;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::memory::Table;
use super::{DocumentBrowser, StoreError, UpsertStore, UpsertSummary};
use crate::frame::{frame_to_documents, Document};

/// Metadata sidecar for a persisted collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub collection: String,
    pub row_count: usize,
    pub data_hash: String,
    pub written_at: NaiveDateTime,
}

/// [`UpsertStore`] and [`DocumentBrowser`] over a directory of JSON files.
///
/// A failed write leaves both the file and the cached table as they were.
pub struct JsonFileStore {
    data_dir: PathBuf,
    tables: Mutex<HashMap<String, Table>>,
    max_connections: usize,
}

impl JsonFileStore {
    /// Store rooted at `data_dir`. The directory is created on first write.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            tables: Mutex::new(HashMap::new()),
            max_connections: 100,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn table_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{collection}.json"))
    }

    fn meta_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{collection}.meta.json"))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sidecar of a persisted collection, if one was written.
    pub fn get_meta(&self, collection: &str) -> Option<TableMeta> {
        let content = fs::read_to_string(self.meta_path(collection)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn load(&self, collection: &str) -> Result<Table, StoreError> {
        let path = self.table_path(collection);
        if !path.exists() {
            return Ok(Table::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        match serde_json::from_str::<Vec<Document>>(&content) {
            Ok(docs) => {
                debug!(collection, rows = docs.len(), "loaded collection file");
                Ok(Table::from_docs(docs))
            }
            Err(e) => {
                let quarantine = path.with_extension("json.quarantined");
                warn!(
                    path = %path.display(),
                    error = %e,
                    "quarantining corrupt collection file"
                );
                let _ = fs::rename(&path, &quarantine);
                Ok(Table::default())
            }
        }
    }

    /// Run `f` against the loaded table for `collection`.
    fn with_table<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Table) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut tables = self.lock();
        if !tables.contains_key(collection) {
            let table = self.load(collection)?;
            tables.insert(collection.to_string(), table);
        }
        match tables.get_mut(collection) {
            Some(table) => f(table),
            None => Err(StoreError::Unavailable(format!("collection {collection} not loaded"))),
        }
    }

    fn persist(&self, collection: &str, table: &Table) -> Result<(), StoreError> {
        fs::create_dir_all(&self.data_dir).map_err(|e| StoreError::Io {
            path: self.data_dir.display().to_string(),
            source: e,
        })?;

        let path = self.table_path(collection);
        let bytes = serde_json::to_vec(&table.docs).map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            reason: format!("serialization failed: {e}"),
        })?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &bytes).map_err(|e| StoreError::Io {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::Io {
                path: path.display().to_string(),
                source: e,
            }
        })?;

        let meta = TableMeta {
            collection: collection.to_string(),
            row_count: table.docs.len(),
            data_hash: blake3::hash(&bytes).to_hex().to_string(),
            written_at: chrono::Local::now().naive_local(),
        };
        let meta_path = self.meta_path(collection);
        let meta_json = serde_json::to_string_pretty(&meta).map_err(|e| StoreError::Corrupt {
            path: meta_path.display().to_string(),
            reason: format!("meta serialization failed: {e}"),
        })?;
        fs::write(&meta_path, meta_json).map_err(|e| StoreError::Io {
            path: meta_path.display().to_string(),
            source: e,
        })
    }
}

impl UpsertStore for JsonFileStore {
    fn upsert(
        &self,
        collection: &str,
        unique_keys: &[String],
        rows: &DataFrame,
        extra_fields: &Document,
    ) -> Result<UpsertSummary, StoreError> {
        let docs = frame_to_documents(rows)?;
        self.with_table(collection, |table| {
            // The cached table only changes once the file on disk does.
            let mut staged = table.clone();
            let summary = staged.upsert_documents(unique_keys, docs, extra_fields)?;
            if summary.written() > 0 {
                self.persist(collection, &staged)?;
                *table = staged;
            }
            Ok(summary)
        })
    }

    fn distinct(&self, collection: &str, field: &str) -> Result<Vec<String>, StoreError> {
        self.with_table(collection, |table| Ok(table.distinct(field)))
    }

    fn project(&self, collection: &str, fields: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
        self.with_table(collection, |table| Ok(table.project(fields)))
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl DocumentBrowser for JsonFileStore {
    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.with_table(collection, |table| Ok(table.docs.len()))
    }

    fn find_page(
        &self,
        collection: &str,
        sort_field: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.with_table(collection, |table| Ok(table.page(sort_field, skip, limit)))
    }

    fn field_bounds(&self, collection: &str, field: &str) -> Result<Option<(String, String)>, StoreError> {
        self.with_table(collection, |table| Ok(table.field_bounds(field)))
    }

    fn clear(&self, collection: &str) -> Result<usize, StoreError> {
        self.with_table(collection, |table| {
            let mut staged = table.clone();
            let removed = staged.clear();
            self.persist(collection, &staged)?;
            *table = staged;
            Ok(removed)
        })
    }
}
