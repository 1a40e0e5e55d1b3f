//! Caller parameter normalization.
//!
//! Callers use their own names (`fund_code`, `code`, `year`); source
//! functions expect theirs (`symbol`, `date`). Mapping runs in two phases:
//! aliases first, in declaration order with the first present alias winning,
//! then a pass-through of every unconsumed key. Control parameters of the
//! calling layer never reach the source.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::descriptor::CollectionDescriptor;
use crate::error::SyncError;

/// Parameters as supplied by a caller. `Null` means "not given".
pub type RawParams = BTreeMap<String, Value>;

/// Parameters as passed to a source function. Values are always strings.
pub type Params = BTreeMap<String, String>;

/// Parameters that belong to the calling layer (paging, task control, mode
/// switches) and are stripped before mapping.
pub const CONTROL_PARAMS: &[&str] = &[
    "update_type",
    "update_mode",
    "batch_update",
    "batch_size",
    "page",
    "limit",
    "skip",
    "filters",
    "sort",
    "order",
    "task_id",
    "callback",
    "async",
    "timeout",
    "_t",
    "_timestamp",
    "force",
    "clear_first",
    "overwrite",
    "mode",
    "concurrency",
];

pub fn is_control_param(name: &str) -> bool {
    CONTROL_PARAMS.contains(&name)
}

/// String form of a caller value; `None` for null.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Maps caller parameters onto one collection's source parameters.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapper<'a> {
    descriptor: &'a CollectionDescriptor,
}

impl<'a> FieldMapper<'a> {
    pub fn new(descriptor: &'a CollectionDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn map_params(&self, raw: &RawParams) -> Params {
        let mut mapped = Params::new();
        let mut consumed: BTreeSet<&str> = BTreeSet::new();

        for (caller_name, source_name) in &self.descriptor.parameter_aliases {
            if is_control_param(caller_name) {
                continue;
            }
            let Some(value) = raw.get(caller_name).and_then(value_to_string) else {
                continue;
            };
            mapped.entry(source_name.clone()).or_insert(value);
            consumed.insert(caller_name.as_str());
        }

        for (name, value) in raw {
            if consumed.contains(name.as_str()) || is_control_param(name) {
                continue;
            }
            if let Some(value) = value_to_string(value) {
                mapped.entry(name.clone()).or_insert(value);
            }
        }

        debug!(
            collection = %self.descriptor.name,
            params = ?mapped,
            "mapped caller parameters"
        );
        mapped
    }

    /// Fails with every required source parameter that is absent.
    pub fn validate(&self, mapped: &Params) -> Result<(), SyncError> {
        let missing: Vec<String> = self
            .descriptor
            .required_params
            .iter()
            .filter(|p| !mapped.contains_key(p.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::MissingParameter(missing))
        }
    }

    /// `map_params` followed by `validate`.
    pub fn map_and_validate(&self, raw: &RawParams) -> Result<Params, SyncError> {
        let mapped = self.map_params(raw);
        self.validate(&mapped)?;
        Ok(mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn raw(pairs: &[(&str, Value)]) -> RawParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn descriptor(aliases: &[(&str, &str)], required: &[&str]) -> CollectionDescriptor {
        CollectionDescriptor {
            parameter_aliases: aliases
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            required_params: required.iter().map(|s| s.to_string()).collect(),
            ..CollectionDescriptor::new("test")
        }
    }

    #[test]
    fn first_alias_wins() {
        let d = descriptor(&[("code", "symbol"), ("symbol", "symbol")], &[]);
        let mapped = FieldMapper::new(&d).map_params(&raw(&[
            ("code", json!("000001")),
            ("symbol", json!("999999")),
        ]));
        assert_eq!(mapped, Params::from([("symbol".into(), "000001".into())]));
    }

    #[test]
    fn null_alias_falls_through_to_next() {
        let d = descriptor(&[("fund_code", "symbol"), ("code", "symbol")], &[]);
        let mapped = FieldMapper::new(&d).map_params(&raw(&[
            ("fund_code", Value::Null),
            ("code", json!("110011")),
        ]));
        assert_eq!(mapped["symbol"], "110011");
        assert!(!mapped.contains_key("fund_code"));
    }

    #[test]
    fn unconsumed_keys_pass_through() {
        let d = descriptor(&[("year", "date")], &[]);
        let mapped = FieldMapper::new(&d).map_params(&raw(&[
            ("year", json!(2024)),
            ("symbol", json!("000001")),
            ("adjust", json!("qfq")),
        ]));
        assert_eq!(mapped["date"], "2024");
        assert_eq!(mapped["symbol"], "000001");
        assert_eq!(mapped["adjust"], "qfq");
        assert!(!mapped.contains_key("year"));
    }

    #[test]
    fn pass_through_never_overwrites_alias_target() {
        let d = descriptor(&[("fund_code", "symbol")], &[]);
        let mapped = FieldMapper::new(&d).map_params(&raw(&[
            ("fund_code", json!("000001")),
            ("symbol", json!("999999")),
        ]));
        assert_eq!(mapped["symbol"], "000001");
    }

    #[test]
    fn control_params_are_stripped() {
        let d = descriptor(&[], &[]);
        let mapped = FieldMapper::new(&d).map_params(&raw(&[
            ("page", json!(2)),
            ("task_id", json!("t-1")),
            ("concurrency", json!(8)),
            ("force", json!(true)),
            ("symbol", json!("000001")),
        ]));
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped["symbol"], "000001");
    }

    #[test]
    fn validate_lists_all_missing() {
        let d = descriptor(&[], &["symbol", "date"]);
        let err = FieldMapper::new(&d).validate(&Params::new()).unwrap_err();
        match err {
            SyncError::MissingParameter(names) => assert_eq!(names, vec!["symbol", "date"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn map_and_validate_accepts_complete_params() {
        let d = descriptor(&[("fund_code", "symbol"), ("year", "date")], &["symbol", "date"]);
        let mapped = FieldMapper::new(&d)
            .map_and_validate(&raw(&[("fund_code", json!("000001")), ("year", json!("2023"))]))
            .unwrap();
        assert_eq!(mapped.len(), 2);
    }

    proptest! {
        #[test]
        fn earliest_present_alias_always_wins(
            values in proptest::collection::vec(proptest::option::of("[0-9]{6}"), 1..5)
        ) {
            let names: Vec<String> = (0..values.len()).map(|i| format!("alias{i}")).collect();
            let d = CollectionDescriptor {
                parameter_aliases: names.iter().map(|n| (n.clone(), "symbol".to_string())).collect(),
                ..CollectionDescriptor::new("prop")
            };
            let input: RawParams = names
                .iter()
                .zip(&values)
                .map(|(n, v)| (n.clone(), v.clone().map(Value::String).unwrap_or(Value::Null)))
                .collect();
            let mapped = FieldMapper::new(&d).map_params(&input);
            let expected = values.iter().flatten().next().cloned();
            prop_assert_eq!(mapped.get("symbol").cloned(), expected);
            prop_assert!(names.iter().all(|n| !mapped.contains_key(n)));
        }
    }
}
