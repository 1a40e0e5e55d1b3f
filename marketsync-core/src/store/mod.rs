//! Document stores: keyed upsert plus the read queries the engine and the
//! collection service need.
//!
//! One collection is one table; one row is one document. [`MemoryStore`]
//! keeps everything in process, [`JsonFileStore`] persists each collection
//! as a JSON array with a metadata sidecar.

pub mod json_file;
pub mod memory;

use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{Document, FrameError};

pub use json_file::{JsonFileStore, TableMeta};
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt collection file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("row {row} is missing unique key '{key}'")]
    MissingKey { row: usize, key: String },

    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of one upsert call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub success: bool,
    pub inserted: usize,
    pub updated: usize,
    /// Matched rows whose stored values were already identical.
    pub unchanged: usize,
    pub message: String,
}

impl UpsertSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Insert-or-update by key, plus the projections the batch engine diffs with.
pub trait UpsertStore: Send + Sync {
    /// Match each row against stored documents by equality on every field of
    /// `unique_keys`; insert when absent, otherwise merge the row (and
    /// `extra_fields`) into the stored document. An empty key list inserts
    /// every row.
    fn upsert(
        &self,
        collection: &str,
        unique_keys: &[String],
        rows: &DataFrame,
        extra_fields: &Document,
    ) -> Result<UpsertSummary, StoreError>;

    /// Distinct non-empty values of `field`, rendered as text, in first-seen order.
    fn distinct(&self, collection: &str, field: &str) -> Result<Vec<String>, StoreError>;

    /// Every document projected onto `fields`. Missing and null values are "".
    fn project(&self, collection: &str, fields: &[String]) -> Result<Vec<Vec<String>>, StoreError>;

    /// Connection capacity; batch concurrency is capped against it.
    fn max_connections(&self) -> usize {
        100
    }
}

/// Read and maintenance queries over stored documents.
pub trait DocumentBrowser: Send + Sync {
    fn count(&self, collection: &str) -> Result<usize, StoreError>;

    /// One page of documents. With `sort_field`, documents are ordered by that
    /// field descending (missing values last); otherwise in insertion order.
    fn find_page(
        &self,
        collection: &str,
        sort_field: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    /// Smallest and largest text value of `field`, if any document has one.
    fn field_bounds(&self, collection: &str, field: &str) -> Result<Option<(String, String)>, StoreError>;

    /// Remove every document; returns how many were removed.
    fn clear(&self, collection: &str) -> Result<usize, StoreError>;
}

impl<T: UpsertStore + ?Sized> UpsertStore for std::sync::Arc<T> {
    fn upsert(
        &self,
        collection: &str,
        unique_keys: &[String],
        rows: &DataFrame,
        extra_fields: &Document,
    ) -> Result<UpsertSummary, StoreError> {
        (**self).upsert(collection, unique_keys, rows, extra_fields)
    }

    fn distinct(&self, collection: &str, field: &str) -> Result<Vec<String>, StoreError> {
        (**self).distinct(collection, field)
    }

    fn project(&self, collection: &str, fields: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
        (**self).project(collection, fields)
    }

    fn max_connections(&self) -> usize {
        (**self).max_connections()
    }
}

/// Text form of a stored value, as used for keys and projections.
pub fn value_text(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
