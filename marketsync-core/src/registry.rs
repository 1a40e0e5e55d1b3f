//! Collection registry: declarative manifests plus programmatic providers.
//!
//! Manifests live under `{manifest_dir}/{category}/*.toml`, each holding one
//! or more `[[collection]]` tables. An optional `{manifest_dir}/metadata.toml`
//! supplies presentation metadata. Discovery runs once and is cached until
//! [`CollectionRegistry::invalidate`] or [`CollectionRegistry::reload`].

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::descriptor::{derive_display_name, CollectionDescriptor, MetadataTable};
use crate::error::SyncError;
use crate::provider::{DescriptorProvider, Provider};

pub const DEFAULT_ORDER: u32 = 100;

const METADATA_FILE: &str = "metadata.toml";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to load {location}: {reason}")]
    Load { location: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    collection: Vec<CollectionDescriptor>,
}

/// Parse one manifest file's contents.
pub fn parse_manifest(content: &str, location: &str) -> Result<Vec<CollectionDescriptor>, RegistryError> {
    toml::from_str::<ManifestFile>(content)
        .map(|m| m.collection)
        .map_err(|e| RegistryError::Load {
            location: location.to_string(),
            reason: e.to_string(),
        })
}

/// A registered collection with its resolved presentation metadata.
pub struct CollectionEntry {
    pub provider: Arc<dyn Provider>,
    pub category: String,
    pub display_name: String,
    pub description: String,
    pub route: String,
    pub order: u32,
    pub visible: bool,
}

impl CollectionEntry {
    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn descriptor(&self) -> &CollectionDescriptor {
        self.provider.descriptor()
    }
}

impl std::fmt::Debug for CollectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionEntry")
            .field("name", &self.name())
            .field("category", &self.category)
            .field("display_name", &self.display_name)
            .field("order", &self.order)
            .field("visible", &self.visible)
            .finish()
    }
}

/// Result of one discovery pass.
#[derive(Debug, Default)]
pub struct Catalog {
    by_name: HashMap<String, Arc<CollectionEntry>>,
    ordered: Vec<Arc<CollectionEntry>>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CollectionEntry>> {
        self.by_name.get(name)
    }

    /// Every entry, hidden ones included, in display order.
    pub fn all(&self) -> &[Arc<CollectionEntry>] {
        &self.ordered
    }
}

/// Discovers collections and resolves them by name.
///
/// Providers registered in code shadow manifest entries of the same name.
/// The catalog is built on first use and cached until [`reload`](Self::reload)
/// or [`invalidate`](Self::invalidate).
pub struct CollectionRegistry {
    manifest_dir: Option<PathBuf>,
    categories: Vec<String>,
    programmatic: Vec<(String, Arc<dyn Provider>)>,
    metadata: Option<MetadataTable>,
    cache: RwLock<Option<Arc<Catalog>>>,
}

impl CollectionRegistry {
    /// Registry over the manifest directory and categories of `config`.
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            manifest_dir: Some(config.manifest_dir.clone()),
            categories: config.categories.clone(),
            programmatic: Vec::new(),
            metadata: None,
            cache: RwLock::new(None),
        }
    }

    /// A registry with no manifest directory; collections come only from
    /// [`register`](Self::register).
    pub fn empty() -> Self {
        Self {
            manifest_dir: None,
            categories: Vec::new(),
            programmatic: Vec::new(),
            metadata: None,
            cache: RwLock::new(None),
        }
    }

    /// Add a provider under a category. Programmatic providers take
    /// precedence over manifest entries with the same name.
    pub fn register(&mut self, category: impl Into<String>, provider: Arc<dyn Provider>) {
        self.programmatic.push((category.into(), provider));
        self.invalidate();
    }

    pub fn with_provider(mut self, category: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(category, provider);
        self
    }

    /// Use this table instead of `metadata.toml`.
    pub fn with_metadata(mut self, metadata: MetadataTable) -> Self {
        self.metadata = Some(metadata);
        self.invalidate();
        self
    }

    pub fn invalidate(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        *cache = None;
    }

    /// Drop the cached catalog and discover again.
    pub fn reload(&self) -> Arc<Catalog> {
        self.invalidate();
        self.catalog()
    }

    /// The cached catalog, discovering it on first use.
    pub fn catalog(&self) -> Arc<Catalog> {
        if let Some(catalog) = self
            .cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            return Arc::clone(catalog);
        }
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        if let Some(catalog) = cache.as_ref() {
            return Arc::clone(catalog);
        }
        let catalog = Arc::new(self.discover());
        *cache = Some(Arc::clone(&catalog));
        catalog
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<CollectionEntry>, SyncError> {
        self.catalog()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))
    }

    pub fn get_descriptor(&self, name: &str) -> Result<CollectionDescriptor, SyncError> {
        self.lookup(name).map(|entry| entry.descriptor().clone())
    }

    /// Visible collections in display order.
    pub fn list_descriptors(&self) -> Vec<Arc<CollectionEntry>> {
        self.catalog()
            .all()
            .iter()
            .filter(|e| e.visible)
            .cloned()
            .collect()
    }

    pub fn list_category(&self, category: &str) -> Vec<Arc<CollectionEntry>> {
        self.list_descriptors()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }

    fn load_metadata(&self) -> MetadataTable {
        if let Some(table) = &self.metadata {
            return table.clone();
        }
        let Some(dir) = &self.manifest_dir else {
            return MetadataTable::default();
        };
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return MetadataTable::default();
        }
        MetadataTable::from_file(&path).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring collection metadata table");
            MetadataTable::default()
        })
    }

    fn discover(&self) -> Catalog {
        let metadata = self.load_metadata();
        let mut found: Vec<(String, Arc<dyn Provider>)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (category, provider) in &self.programmatic {
            if accept(provider.name(), &mut seen, category) {
                found.push((category.clone(), Arc::clone(provider)));
            }
        }

        if let Some(dir) = &self.manifest_dir {
            for category in &self.categories {
                for descriptor in scan_category(&dir.join(category)) {
                    if accept(&descriptor.name, &mut seen, category) {
                        found.push((category.clone(), Arc::new(DescriptorProvider::new(descriptor))));
                    }
                }
            }
        }

        let mut ordered: Vec<Arc<CollectionEntry>> = found
            .into_iter()
            .map(|(category, provider)| Arc::new(resolve_entry(category, provider, &metadata)))
            .collect();
        ordered.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.display_name.cmp(&b.display_name))
        });

        let by_name = ordered
            .iter()
            .map(|e| (e.name().to_string(), Arc::clone(e)))
            .collect();
        info!(collections = ordered.len(), "collection discovery complete");
        Catalog { by_name, ordered }
    }
}

fn accept(name: &str, seen: &mut HashSet<String>, category: &str) -> bool {
    if name.trim().is_empty() {
        warn!(category, "skipping collection without a name");
        return false;
    }
    if !seen.insert(name.to_string()) {
        debug!(collection = name, category, "duplicate collection, keeping the first");
        return false;
    }
    true
}

/// Descriptors from every `*.toml` in `dir`, in file-name order. Unreadable
/// or malformed files are logged and skipped.
fn scan_category(dir: &Path) -> Vec<CollectionDescriptor> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "no manifests for category");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
        .collect();
    files.sort();

    let mut descriptors = Vec::new();
    for path in files {
        let location = path.display().to_string();
        let loaded = fs::read_to_string(&path)
            .map_err(|e| RegistryError::Load {
                location: location.clone(),
                reason: e.to_string(),
            })
            .and_then(|content| parse_manifest(&content, &location));
        match loaded {
            Ok(found) => descriptors.extend(found),
            Err(e) => warn!(error = %e, "skipping collection manifest"),
        }
    }
    descriptors
}

/// Explicit descriptor values win over the metadata table, which wins over
/// name-derived defaults.
fn resolve_entry(category: String, provider: Arc<dyn Provider>, metadata: &MetadataTable) -> CollectionEntry {
    let descriptor = provider.descriptor();
    let meta = metadata.get(&descriptor.name).cloned().unwrap_or_default();

    let display_name = descriptor
        .display_name
        .clone()
        .or(meta.display_name)
        .unwrap_or_else(|| derive_display_name(&descriptor.name));
    let description = descriptor
        .description
        .clone()
        .or(meta.description)
        .unwrap_or_default();
    let route = descriptor
        .route
        .clone()
        .or(meta.route)
        .unwrap_or_else(|| format!("/{category}/collections/{}", descriptor.name));
    let order = descriptor.order.or(meta.order).unwrap_or(DEFAULT_ORDER);
    let visible = descriptor.visible;

    CollectionEntry {
        provider,
        category,
        display_name,
        description,
        route,
        order,
        visible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CollectionMetadata;

    fn provider(name: &str) -> Arc<dyn Provider> {
        Arc::new(DescriptorProvider::new(CollectionDescriptor::new(name)))
    }

    #[test]
    fn overlay_precedence() {
        let mut metadata = MetadataTable::default();
        metadata.insert(
            "stock_zh_a_spot_em",
            CollectionMetadata {
                display_name: Some("沪深京A股实时行情-东财".into()),
                order: Some(1),
                ..CollectionMetadata::default()
            },
        );
        metadata.insert(
            "explicit",
            CollectionMetadata {
                display_name: Some("from table".into()),
                ..CollectionMetadata::default()
            },
        );
        let explicit = CollectionDescriptor {
            display_name: Some("from descriptor".into()),
            ..CollectionDescriptor::new("explicit")
        };
        let registry = CollectionRegistry::empty()
            .with_provider("stocks", provider("stock_zh_a_spot_em"))
            .with_provider("stocks", Arc::new(DescriptorProvider::new(explicit)))
            .with_provider("bonds", provider("bond_cb_jsl"))
            .with_metadata(metadata);

        let spot = registry.lookup("stock_zh_a_spot_em").unwrap();
        assert_eq!(spot.display_name, "沪深京A股实时行情-东财");
        assert_eq!(spot.order, 1);
        assert_eq!(spot.route, "/stocks/collections/stock_zh_a_spot_em");
        assert_eq!(registry.lookup("explicit").unwrap().display_name, "from descriptor");
        let bond = registry.lookup("bond_cb_jsl").unwrap();
        assert_eq!(bond.display_name, "Bond Cb Jsl");
        assert_eq!(bond.order, DEFAULT_ORDER);
        assert_eq!(bond.description, "");
    }

    #[test]
    fn listing_sorts_by_order_then_name_and_hides_invisible() {
        let hidden = CollectionDescriptor {
            visible: false,
            ..CollectionDescriptor::new("hidden")
        };
        let first = CollectionDescriptor {
            order: Some(1),
            ..CollectionDescriptor::new("zzz")
        };
        let registry = CollectionRegistry::empty()
            .with_provider("funds", provider("bbb"))
            .with_provider("funds", provider("aaa"))
            .with_provider("funds", Arc::new(DescriptorProvider::new(first)))
            .with_provider("funds", Arc::new(DescriptorProvider::new(hidden)));
        let names: Vec<String> = registry
            .list_descriptors()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["zzz", "aaa", "bbb"]);
        assert!(registry.lookup("hidden").is_ok());
        assert_eq!(registry.list_category("bonds").len(), 0);
    }

    #[test]
    fn unknown_collection() {
        let err = CollectionRegistry::empty().lookup("nope").unwrap_err();
        assert!(matches!(err, SyncError::UnknownCollection(ref n) if n == "nope"));
    }

    #[test]
    fn nameless_and_duplicate_entries_are_dropped() {
        let registry = CollectionRegistry::empty()
            .with_provider("funds", provider(""))
            .with_provider("funds", provider("fund_name_em"))
            .with_provider("stocks", provider("fund_name_em"));
        let catalog = registry.catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("fund_name_em").unwrap().category, "funds");
    }

    #[test]
    fn manifest_parses_many_collections() {
        let found = parse_manifest(
            r#"
            [[collection]]
            name = "fund_name_em"
            unique_keys = ["基金代码"]

            [[collection]]
            name = "fund_etf_spot_em"
            "#,
            "inline",
        )
        .unwrap();
        assert_eq!(found.len(), 2);
        assert!(parse_manifest("[[collection]]\nunique_keys = 3", "inline").is_err());
    }

    #[test]
    fn catalog_is_cached_until_invalidated() {
        let registry = CollectionRegistry::empty().with_provider("funds", provider("a"));
        let first = registry.catalog();
        assert!(Arc::ptr_eq(&first, &registry.catalog()));
        registry.invalidate();
        assert!(!Arc::ptr_eq(&first, &registry.catalog()));
        assert!(!Arc::ptr_eq(&first, &registry.reload()));
    }
}
