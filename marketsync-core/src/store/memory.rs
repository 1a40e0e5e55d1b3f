//! In-process document store.

use polars::prelude::DataFrame;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{value_text, DocumentBrowser, StoreError, UpsertStore, UpsertSummary};
use crate::frame::{frame_to_documents, Document};

const KEY_SEPARATOR: char = '\u{1f}';

/// One collection's documents plus a key index for the last key set used.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub(crate) docs: Vec<Document>,
    index_keys: Vec<String>,
    index: HashMap<String, usize>,
}

fn composite_key(doc: &Document, keys: &[String]) -> String {
    let mut out = String::new();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(KEY_SEPARATOR);
        }
        out.push_str(&value_text(doc.get(key)));
    }
    out
}

impl Table {
    pub(crate) fn from_docs(docs: Vec<Document>) -> Self {
        Self {
            docs,
            ..Self::default()
        }
    }

    fn reindex(&mut self, keys: &[String]) {
        if self.index_keys == keys && self.index.len() == self.docs.len() {
            return;
        }
        self.index_keys = keys.to_vec();
        self.index = self
            .docs
            .iter()
            .enumerate()
            .map(|(i, doc)| (composite_key(doc, keys), i))
            .collect();
    }

    pub(crate) fn upsert_documents(
        &mut self,
        unique_keys: &[String],
        rows: Vec<Document>,
        extra_fields: &Document,
    ) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary {
            success: true,
            ..UpsertSummary::default()
        };

        if unique_keys.is_empty() {
            for mut doc in rows {
                doc.extend(extra_fields.clone());
                self.docs.push(doc);
                summary.inserted += 1;
            }
            self.index_keys.clear();
            self.index.clear();
        } else {
            for (row, doc) in rows.iter().enumerate() {
                if let Some(key) = unique_keys.iter().find(|k| !doc.contains_key(k.as_str())) {
                    return Err(StoreError::MissingKey {
                        row,
                        key: key.clone(),
                    });
                }
            }
            self.reindex(unique_keys);
            for mut doc in rows {
                doc.extend(extra_fields.clone());
                let key = composite_key(&doc, unique_keys);
                match self.index.get(&key).copied() {
                    Some(idx) => {
                        let stored = &mut self.docs[idx];
                        let mut merged = stored.clone();
                        merged.extend(doc);
                        if merged == *stored {
                            summary.unchanged += 1;
                        } else {
                            *stored = merged;
                            summary.updated += 1;
                        }
                    }
                    None => {
                        self.index.insert(key, self.docs.len());
                        self.docs.push(doc);
                        summary.inserted += 1;
                    }
                }
            }
        }

        summary.message = format!(
            "inserted {}, updated {}, unchanged {}",
            summary.inserted, summary.updated, summary.unchanged
        );
        Ok(summary)
    }

    pub(crate) fn distinct(&self, field: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.docs
            .iter()
            .map(|doc| value_text(doc.get(field)))
            .filter(|v| !v.is_empty() && seen.insert(v.clone()))
            .collect()
    }

    pub(crate) fn project(&self, fields: &[String]) -> Vec<Vec<String>> {
        self.docs
            .iter()
            .map(|doc| fields.iter().map(|f| value_text(doc.get(f))).collect())
            .collect()
    }

    pub(crate) fn page(&self, sort_field: Option<&str>, skip: usize, limit: usize) -> Vec<Document> {
        let mut order: Vec<&Document> = self.docs.iter().collect();
        if let Some(field) = sort_field {
            order.sort_by(|a, b| compare_desc(a.get(field), b.get(field)));
        }
        order.into_iter().skip(skip).take(limit).cloned().collect()
    }

    pub(crate) fn field_bounds(&self, field: &str) -> Option<(String, String)> {
        let mut values = self
            .docs
            .iter()
            .map(|doc| value_text(doc.get(field)))
            .filter(|v| !v.is_empty());
        let first = values.next()?;
        Some(values.fold((first.clone(), first), |(lo, hi), v| {
            let lo = if v < lo { v.clone() } else { lo };
            let hi = if v > hi { v } else { hi };
            (lo, hi)
        }))
    }

    pub(crate) fn clear(&mut self) -> usize {
        let removed = self.docs.len();
        self.docs.clear();
        self.index.clear();
        self.index_keys.clear();
        removed
    }
}

/// Descending by value; numbers compare numerically, missing and null last.
fn compare_desc(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
            _ => value_text(Some(b)).cmp(&value_text(Some(a))),
        },
    }
}

/// Thread-safe in-memory store. Used by tests and as the engine's default
/// scratch store.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
    max_connections: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_connections(100)
    }

    pub fn with_max_connections(max_connections: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Table>> {
        self.tables.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Table>> {
        self.tables.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Append documents as-is, e.g. to seed a source collection.
    pub fn insert_documents(&self, collection: &str, docs: impl IntoIterator<Item = Document>) {
        let mut tables = self.write();
        let table = tables.entry(collection.to_string()).or_default();
        table.docs.extend(docs);
    }

    /// A copy of every document in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.read()
            .get(collection)
            .map(|t| t.docs.clone())
            .unwrap_or_default()
    }
}

impl UpsertStore for MemoryStore {
    fn upsert(
        &self,
        collection: &str,
        unique_keys: &[String],
        rows: &DataFrame,
        extra_fields: &Document,
    ) -> Result<UpsertSummary, StoreError> {
        let docs = frame_to_documents(rows)?;
        let mut tables = self.write();
        tables
            .entry(collection.to_string())
            .or_default()
            .upsert_documents(unique_keys, docs, extra_fields)
    }

    fn distinct(&self, collection: &str, field: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read()
            .get(collection)
            .map(|t| t.distinct(field))
            .unwrap_or_default())
    }

    fn project(&self, collection: &str, fields: &[String]) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self
            .read()
            .get(collection)
            .map(|t| t.project(fields))
            .unwrap_or_default())
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl DocumentBrowser for MemoryStore {
    fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.read().get(collection).map_or(0, |t| t.docs.len()))
    }

    fn find_page(
        &self,
        collection: &str,
        sort_field: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .read()
            .get(collection)
            .map(|t| t.page(sort_field, skip, limit))
            .unwrap_or_default())
    }

    fn field_bounds(&self, collection: &str, field: &str) -> Result<Option<(String, String)>, StoreError> {
        Ok(self.read().get(collection).and_then(|t| t.field_bounds(field)))
    }

    fn clear(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.write().get_mut(collection).map_or(0, Table::clear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::records_to_frame;
    use serde_json::json;

    fn frame(rows: Value) -> DataFrame {
        let docs: Vec<Document> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect();
        records_to_frame(&docs).unwrap()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn insert_then_update_by_key() {
        let store = MemoryStore::new();
        let k = keys(&["code", "year"]);
        let first = store
            .upsert("t", &k, &frame(json!([{"code": "1", "year": "2024", "v": 1}, {"code": "2", "year": "2024", "v": 2}])), &Document::new())
            .unwrap();
        assert_eq!((first.inserted, first.updated), (2, 0));

        let second = store
            .upsert("t", &k, &frame(json!([{"code": "1", "year": "2024", "v": 5}, {"code": "1", "year": "2023", "v": 1}])), &Document::new())
            .unwrap();
        assert_eq!((second.inserted, second.updated), (1, 1));
        assert_eq!(store.count("t").unwrap(), 3);
    }

    #[test]
    fn identical_rows_are_unchanged() {
        let store = MemoryStore::new();
        let k = keys(&["code"]);
        let rows = frame(json!([{"code": "1", "v": 1}]));
        store.upsert("t", &k, &rows, &Document::new()).unwrap();
        let again = store.upsert("t", &k, &rows, &Document::new()).unwrap();
        assert_eq!((again.inserted, again.updated, again.unchanged), (0, 0, 1));
        assert_eq!(store.count("t").unwrap(), 1);
    }

    #[test]
    fn extra_fields_are_merged() {
        let store = MemoryStore::new();
        let mut extra = Document::new();
        extra.insert("数据源".into(), json!("akshare"));
        store
            .upsert("t", &keys(&["code"]), &frame(json!([{"code": "1"}])), &extra)
            .unwrap();
        assert_eq!(store.documents("t")[0]["数据源"], json!("akshare"));
    }

    #[test]
    fn missing_key_column_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .upsert("t", &keys(&["code"]), &frame(json!([{"name": "x"}])), &Document::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { row: 0, .. }));
    }

    #[test]
    fn empty_keys_always_insert() {
        let store = MemoryStore::new();
        let rows = frame(json!([{"code": "1"}]));
        store.upsert("t", &[], &rows, &Document::new()).unwrap();
        store.upsert("t", &[], &rows, &Document::new()).unwrap();
        assert_eq!(store.count("t").unwrap(), 2);
    }

    #[test]
    fn distinct_and_project() {
        let store = MemoryStore::new();
        store.insert_documents(
            "codes",
            [json!({"code": "1", "name": "a"}), json!({"code": "2"}), json!({"code": "1", "name": null})]
                .into_iter()
                .map(|v| v.as_object().cloned().unwrap()),
        );
        assert_eq!(store.distinct("codes", "code").unwrap(), vec!["1", "2"]);
        assert_eq!(
            store.project("codes", &keys(&["code", "name"])).unwrap(),
            vec![vec!["1", "a"], vec!["2", ""], vec!["1", ""]]
        );
        assert!(store.distinct("missing", "code").unwrap().is_empty());
    }

    #[test]
    fn pages_sort_descending_with_missing_last() {
        let store = MemoryStore::new();
        store.insert_documents(
            "t",
            [json!({"id": 1, "at": "2024-01-01"}), json!({"id": 2}), json!({"id": 3, "at": "2024-03-01"})]
                .into_iter()
                .map(|v| v.as_object().cloned().unwrap()),
        );
        let page = store.find_page("t", Some("at"), 0, 10).unwrap();
        let ids: Vec<i64> = page.iter().map(|d| d["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(store.find_page("t", None, 1, 1).unwrap()[0]["id"], json!(2));
        assert_eq!(
            store.field_bounds("t", "at").unwrap(),
            Some(("2024-01-01".into(), "2024-03-01".into()))
        );
        assert_eq!(store.clear("t").unwrap(), 3);
        assert_eq!(store.count("t").unwrap(), 0);
    }
}
