//! Declarative collection configuration.
//!
//! A [`CollectionDescriptor`] holds everything the engine needs to sync one
//! collection: which source function to call, how caller parameters map onto
//! it, how rows are keyed, and where batch candidates come from. Descriptors
//! are plain data. Overriding one setting for a collection means building the
//! struct with that field changed:
//!
//! ```
//! use marketsync_core::descriptor::{BatchConfig, CollectionDescriptor};
//!
//! let holdings = CollectionDescriptor {
//!     unique_keys: vec!["基金代码".into(), "股票代码".into(), "季度".into()],
//!     batch: Some(BatchConfig {
//!         concurrency: Some(5),
//!         ..BatchConfig::from_source("fund_name_em", "基金代码")
//!     }),
//!     ..CollectionDescriptor::new("fund_portfolio_hold_em")
//! };
//! assert_eq!(holdings.function(), "fund_portfolio_hold_em");
//! ```

pub mod metadata;

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use metadata::{derive_display_name, CollectionMetadata, MetadataTable};

pub const DEFAULT_TIMESTAMP_FIELD: &str = "scraped_at";

/// One output column of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    #[serde(default)]
    pub description: String,
}

fn default_field_type() -> String {
    "string".into()
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            description: String::new(),
        }
    }
}

/// Static configuration for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    /// Source function to call; defaults to `name`.
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub unique_keys: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    /// Ordered caller-name → source-name pairs. Several caller names may
    /// target the same source name; the first present one wins.
    #[serde(default)]
    pub parameter_aliases: Vec<(String, String)>,
    /// Source-facing parameter names that must be present after mapping.
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Source parameter → output column that always carries its value.
    #[serde(default)]
    pub add_param_columns: Vec<(String, String)>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default)]
    pub batch: Option<BatchConfig>,
}

fn default_visible() -> bool {
    true
}

fn default_timestamp_field() -> String {
    DEFAULT_TIMESTAMP_FIELD.into()
}

impl CollectionDescriptor {
    /// A descriptor with every optional setting at its default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: None,
            display_name: None,
            description: None,
            route: None,
            order: None,
            visible: true,
            unique_keys: Vec::new(),
            fields: Vec::new(),
            parameter_aliases: Vec::new(),
            required_params: Vec::new(),
            add_param_columns: Vec::new(),
            timestamp_field: default_timestamp_field(),
            batch: None,
        }
    }

    /// Name of the source function backing this collection.
    pub fn function(&self) -> &str {
        self.function.as_deref().unwrap_or(&self.name)
    }

    /// Declared fields, or just the timestamp field when none are declared.
    pub fn field_info(&self) -> Vec<FieldInfo> {
        if self.fields.is_empty() {
            vec![FieldInfo {
                name: self.timestamp_field.clone(),
                field_type: "datetime".into(),
                description: "scrape time".into(),
            }]
        } else {
            self.fields.clone()
        }
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// Where batch candidates come from and how the batch run behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub source_collection: String,
    pub source_field: String,
    #[serde(default)]
    pub year_range: Option<YearRange>,
    /// Add a year dimension even without a configured range (current year).
    #[serde(default)]
    pub use_year: bool,
    /// Overrides `engine.default_concurrency` for this collection.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Overrides `engine.progress_interval` for this collection.
    #[serde(default)]
    pub progress_interval: Option<usize>,
    #[serde(default)]
    pub incremental_check_fields: Vec<String>,
    #[serde(default)]
    pub field_extractors: BTreeMap<String, FieldExtractor>,
    /// Caller-facing keys a fetch task is turned into.
    #[serde(default)]
    pub task_params: TaskParamKeys,
}

impl BatchConfig {
    pub fn from_source(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            source_collection: collection.into(),
            source_field: field.into(),
            year_range: None,
            use_year: false,
            concurrency: None,
            progress_interval: None,
            incremental_check_fields: Vec::new(),
            field_extractors: BTreeMap::new(),
            task_params: TaskParamKeys::default(),
        }
    }

    /// True when fetch tasks carry a year alongside the code.
    pub fn has_year_dimension(&self) -> bool {
        self.use_year || self.year_range.is_some()
    }

    /// Parameter key used for the code of a fetch task.
    pub fn code_param(&self) -> &str {
        self.task_params.code.as_deref().unwrap_or(&self.source_field)
    }

    pub fn year_param(&self) -> &str {
        &self.task_params.year
    }
}

/// Inclusive year span; an open end means "through the current year".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: i32,
    #[serde(default)]
    pub end: Option<i32>,
}

impl YearRange {
    pub fn years(&self, current_year: i32) -> Vec<String> {
        let end = self.end.unwrap_or(current_year);
        (self.start..=end).map(|y| y.to_string()).collect()
    }

    pub fn through_current(start: i32) -> Self {
        Self { start, end: None }
    }
}

/// Parameter keys used to turn a fetch task into call parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskParamKeys {
    /// Defaults to the batch source field.
    pub code: Option<String>,
    pub year: String,
}

impl Default for TaskParamKeys {
    fn default() -> Self {
        Self {
            code: None,
            year: "year".into(),
        }
    }
}

/// Normalizes a stored field value before it is compared with fetch tasks,
/// e.g. `"2024年1季度"` → `"2024"`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldExtractor {
    /// First four characters when they are all digits, otherwise empty.
    LeadingYear,
    /// First `len` characters.
    Prefix { len: usize },
    /// Text before the first occurrence of `separator`.
    Before { separator: String },
    #[serde(skip)]
    Custom(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl FieldExtractor {
    pub fn custom(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        FieldExtractor::Custom(Arc::new(f))
    }

    pub fn extract(&self, value: &str) -> String {
        match self {
            FieldExtractor::LeadingYear => {
                let head: String = value.chars().take(4).collect();
                if head.chars().count() == 4 && head.chars().all(|c| c.is_ascii_digit()) {
                    head
                } else {
                    String::new()
                }
            }
            FieldExtractor::Prefix { len } => value.chars().take(*len).collect(),
            FieldExtractor::Before { separator } => value
                .split_once(separator.as_str())
                .map(|(head, _)| head.to_string())
                .unwrap_or_else(|| value.to_string()),
            FieldExtractor::Custom(f) => f(value),
        }
    }
}

impl fmt::Debug for FieldExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldExtractor::LeadingYear => write!(f, "LeadingYear"),
            FieldExtractor::Prefix { len } => write!(f, "Prefix({len})"),
            FieldExtractor::Before { separator } => write!(f, "Before({separator:?})"),
            FieldExtractor::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Current calendar year in local time.
pub fn current_year() -> i32 {
    chrono::Local::now().year()
}
