//! Static collection metadata table and name-derived defaults.
//!
//! The table lives in `metadata.toml` next to the manifests:
//!
//! ```toml
//! [collections.stock_zh_a_spot_em]
//! display_name = "沪深京A股实时行情-东财"
//! order = 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::registry::RegistryError;

/// Hand-maintained presentation metadata for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionMetadata {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub route: Option<String>,
    pub order: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataTable {
    #[serde(default)]
    pub collections: HashMap<String, CollectionMetadata>,
}

impl MetadataTable {
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::Load {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            RegistryError::Load { reason, .. } => RegistryError::Load {
                location: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, RegistryError> {
        toml::from_str(content).map_err(|e| RegistryError::Load {
            location: "<metadata>".into(),
            reason: e.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&CollectionMetadata> {
        self.collections.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, meta: CollectionMetadata) {
        self.collections.insert(name.into(), meta);
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

const SUFFIX_LABELS: &[(&str, &str)] = &[
    ("_em", "-东财"),
    ("_sina", "-新浪"),
    ("_ths", "-同花顺"),
    ("_xq", "-雪球"),
    ("_lg", "-乐咕"),
    ("_cninfo", "-巨潮"),
    ("_baidu", "-百度"),
];

const PREFIX_LABELS: &[(&str, &str)] = &[
    ("stock_zh_a_", "A股"),
    ("stock_zh_b_", "B股"),
    ("stock_hk_", "港股"),
    ("stock_us_", "美股"),
    ("stock_", "股票"),
];

/// Display name derived from a snake_case collection name.
///
/// `stock_zh_a_hist_em` → `A股Hist-东财`; unknown prefixes keep their words:
/// `bond_cb_jsl` → `Bond Cb Jsl`.
pub fn derive_display_name(name: &str) -> String {
    let mut display = name.to_string();
    if let Some((suffix, label)) = SUFFIX_LABELS.iter().find(|(s, _)| display.ends_with(s)) {
        display.truncate(display.len() - suffix.len());
        display.push_str(label);
    }
    if let Some((prefix, label)) = PREFIX_LABELS.iter().find(|(p, _)| display.starts_with(p)) {
        display = format!("{label}{}", &display[prefix.len()..]);
    }
    title_case(&display.replace('_', " "))
}

/// Uppercase the first ASCII letter of every word, lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for c in text.chars() {
        if c.is_ascii_alphabetic() {
            if at_word_start {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c.to_ascii_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = !c.is_ascii_digit();
        }
    }
    out
}
