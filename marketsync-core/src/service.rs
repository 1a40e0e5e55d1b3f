//! Read-side queries over a synced collection.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::descriptor::{CollectionDescriptor, FieldInfo};
use crate::frame::Document;
use crate::store::{DocumentBrowser, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Counts and time span of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionOverview {
    pub name: String,
    pub total: usize,
    /// Oldest and newest value of the timestamp field.
    pub oldest: Option<String>,
    pub newest: Option<String>,
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrowsePage {
    pub total: usize,
    pub skip: usize,
    pub limit: usize,
    pub documents: Vec<Document>,
}

pub struct CollectionService {
    store: Arc<dyn DocumentBrowser>,
}

impl CollectionService {
    pub fn new(store: Arc<dyn DocumentBrowser>) -> Self {
        Self { store }
    }

    pub fn overview(&self, descriptor: &CollectionDescriptor) -> Result<CollectionOverview, StoreError> {
        let total = self.store.count(&descriptor.name)?;
        let bounds = self
            .store
            .field_bounds(&descriptor.name, &descriptor.timestamp_field)?;
        let (oldest, newest) = match bounds {
            Some((lo, hi)) => (Some(lo), Some(hi)),
            None => (None, None),
        };
        Ok(CollectionOverview {
            name: descriptor.name.clone(),
            total,
            oldest,
            newest,
            fields: descriptor.field_info(),
        })
    }

    /// Newest documents first. `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn browse(
        &self,
        descriptor: &CollectionDescriptor,
        skip: usize,
        limit: usize,
    ) -> Result<BrowsePage, StoreError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let total = self.store.count(&descriptor.name)?;
        let documents = self.store.find_page(
            &descriptor.name,
            Some(&descriptor.timestamp_field),
            skip,
            limit,
        )?;
        Ok(BrowsePage {
            total,
            skip,
            limit,
            documents,
        })
    }

    /// Delete every document of the collection.
    pub fn clear(&self, descriptor: &CollectionDescriptor) -> Result<usize, StoreError> {
        let removed = self.store.clear(&descriptor.name)?;
        info!(collection = %descriptor.name, removed, "collection cleared");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn seeded() -> (Arc<MemoryStore>, CollectionDescriptor) {
        let store = Arc::new(MemoryStore::new());
        store.insert_documents(
            "fund_name_em",
            (1..=5).map(|i| {
                json!({"基金代码": format!("00000{i}"), "scraped_at": format!("2024-01-0{i}T00:00:00")})
                    .as_object()
                    .cloned()
                    .unwrap()
            }),
        );
        (store, CollectionDescriptor::new("fund_name_em"))
    }

    #[test]
    fn overview_reports_span() {
        let (store, d) = seeded();
        let service = CollectionService::new(store);
        let overview = service.overview(&d).unwrap();
        assert_eq!(overview.total, 5);
        assert_eq!(overview.oldest.as_deref(), Some("2024-01-01T00:00:00"));
        assert_eq!(overview.newest.as_deref(), Some("2024-01-05T00:00:00"));
        assert_eq!(overview.fields[0].name, "scraped_at");
    }

    #[test]
    fn browse_pages_newest_first() {
        let (store, d) = seeded();
        let service = CollectionService::new(store);
        let page = service.browse(&d, 1, 2).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.documents.len(), 2);
        assert_eq!(page.documents[0]["基金代码"], json!("000004"));
        assert_eq!(service.browse(&d, 0, 0).unwrap().limit, 1);
    }

    #[test]
    fn clear_reports_removed() {
        let (store, d) = seeded();
        let service = CollectionService::new(store.clone());
        assert_eq!(service.clear(&d).unwrap(), 5);
        assert_eq!(service.overview(&d).unwrap().total, 0);
        assert!(service.overview(&d).unwrap().newest.is_none());
    }
}
