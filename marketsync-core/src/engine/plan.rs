//! Batch planning: candidate fetch tasks and the incremental diff.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::descriptor::{BatchConfig, FieldExtractor};
use crate::error::SyncError;
use crate::field_mapper::{value_to_string, RawParams};

/// One unit of batch work: a code, plus a year when the collection has a
/// year dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchTask {
    pub code: String,
    pub year: Option<String>,
}

impl FetchTask {
    pub fn new(code: impl Into<String>, year: Option<String>) -> Self {
        Self {
            code: code.into(),
            year,
        }
    }

    /// The task as a key tuple, in (code, year) order.
    pub fn values(&self) -> Vec<&str> {
        let mut values = vec![self.code.as_str()];
        if let Some(year) = &self.year {
            values.push(year.as_str());
        }
        values
    }
}

impl fmt::Display for FetchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.year {
            Some(year) => write!(f, "{}/{year}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Years a batch run covers, or `None` when tasks carry no year.
///
/// Collections without a year dimension ignore any year parameter. Otherwise
/// an explicit year wins, then the configured range, then the current year.
pub fn resolve_years(
    batch: &BatchConfig,
    raw: &RawParams,
    current_year: i32,
) -> Result<Option<Vec<String>>, SyncError> {
    if !batch.has_year_dimension() {
        return Ok(None);
    }
    let key = batch.year_param();
    if let Some(explicit) = raw.get(key).and_then(value_to_string) {
        let trimmed = explicit.trim();
        return match trimmed.parse::<i32>() {
            Ok(year) if (1900..=9999).contains(&year) => Ok(Some(vec![year.to_string()])),
            _ => Err(SyncError::InvalidParameter {
                name: key.to_string(),
                reason: format!("'{explicit}' is not a four-digit year"),
            }),
        };
    }
    if let Some(range) = &batch.year_range {
        return Ok(Some(range.years(current_year)));
    }
    Ok(Some(vec![current_year.to_string()]))
}

/// Cross product of codes and years, in code-major order.
pub fn candidate_tasks(codes: &[String], years: Option<&[String]>) -> Vec<FetchTask> {
    match years {
        Some(years) => codes
            .iter()
            .flat_map(|code| {
                years
                    .iter()
                    .map(move |year| FetchTask::new(code.clone(), Some(year.clone())))
            })
            .collect(),
        None => codes.iter().map(|code| FetchTask::new(code.clone(), None)).collect(),
    }
}

/// Key tuples already present in the target collection.
#[derive(Debug, Clone, Default)]
pub struct ExistingKeySet {
    keys: HashSet<Vec<String>>,
}

impl ExistingKeySet {
    /// Build from projected rows. Each value goes through its field's
    /// extractor; a row counts only if every extracted value is non-empty.
    pub fn from_rows(
        rows: Vec<Vec<String>>,
        fields: &[String],
        extractors: &BTreeMap<String, FieldExtractor>,
    ) -> Self {
        let keys = rows
            .into_iter()
            .filter_map(|row| {
                let extracted: Vec<String> = fields
                    .iter()
                    .zip(row)
                    .map(|(field, value)| match extractors.get(field) {
                        Some(extractor) => extractor.extract(&value),
                        None => value,
                    })
                    .collect();
                let complete = extracted.len() == fields.len()
                    && extracted.iter().all(|v| !v.trim().is_empty());
                complete.then_some(extracted)
            })
            .collect();
        Self { keys }
    }

    pub fn contains(&self, task: &FetchTask) -> bool {
        let key: Vec<String> = task.values().into_iter().map(str::to_string).collect();
        self.keys.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Tasks of a batch run after the incremental diff.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub tasks: Vec<FetchTask>,
    pub candidates: usize,
    pub skipped: usize,
}

/// Drop every candidate whose key tuple already exists.
pub fn diff(candidates: Vec<FetchTask>, existing: Option<&ExistingKeySet>) -> BatchPlan {
    let total = candidates.len();
    let tasks: Vec<FetchTask> = match existing {
        Some(existing) if !existing.is_empty() => candidates
            .into_iter()
            .filter(|task| !existing.contains(task))
            .collect(),
        _ => candidates,
    };
    BatchPlan {
        candidates: total,
        skipped: total - tasks.len(),
        tasks,
    }
}

/// Caller-facing parameters for one task: the code under the code key, the
/// year under the year key.
pub fn task_params(batch: &BatchConfig, task: &FetchTask) -> RawParams {
    let mut params = RawParams::new();
    params.insert(batch.code_param().to_string(), Value::String(task.code.clone()));
    if let Some(year) = &task.year {
        params.insert(batch.year_param().to_string(), Value::String(year.clone()));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::YearRange;
    use proptest::prelude::*;
    use serde_json::json;

    fn batch() -> BatchConfig {
        BatchConfig::from_source("fund_name_em", "基金代码")
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn explicit_year_wins_over_range() {
        let b = BatchConfig {
            year_range: Some(YearRange { start: 2010, end: Some(2012) }),
            ..batch()
        };
        let raw = RawParams::from([("year".into(), json!(2020))]);
        assert_eq!(resolve_years(&b, &raw, 2024).unwrap(), Some(strings(&["2020"])));
        assert_eq!(
            resolve_years(&b, &RawParams::new(), 2024).unwrap(),
            Some(strings(&["2010", "2011", "2012"]))
        );
    }

    #[test]
    fn year_defaults() {
        assert_eq!(resolve_years(&batch(), &RawParams::new(), 2024).unwrap(), None);
        let b = BatchConfig {
            use_year: true,
            ..batch()
        };
        assert_eq!(resolve_years(&b, &RawParams::new(), 2024).unwrap(), Some(strings(&["2024"])));
    }

    #[test]
    fn year_parameter_ignored_without_year_dimension() {
        let raw = RawParams::from([("year".into(), json!("2024"))]);
        assert_eq!(resolve_years(&batch(), &raw, 2024).unwrap(), None);
        let raw = RawParams::from([("year".into(), json!("last"))]);
        assert_eq!(resolve_years(&batch(), &raw, 2024).unwrap(), None);
    }

    #[test]
    fn bad_year_is_invalid_parameter() {
        let b = BatchConfig {
            use_year: true,
            ..batch()
        };
        let raw = RawParams::from([("year".into(), json!("last"))]);
        let err = resolve_years(&b, &raw, 2024).unwrap_err();
        assert!(matches!(err, SyncError::InvalidParameter { ref name, .. } if name == "year"));
    }

    #[test]
    fn candidates_cross_codes_and_years() {
        let tasks = candidate_tasks(&strings(&["A", "B"]), Some(&strings(&["2023", "2024"])));
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[1], FetchTask::new("A", Some("2024".into())));
        assert_eq!(candidate_tasks(&strings(&["A"]), None)[0].to_string(), "A");
    }

    #[test]
    fn existing_rows_need_every_value() {
        let fields = strings(&["基金代码", "季度"]);
        let extractors = BTreeMap::from([("季度".to_string(), FieldExtractor::LeadingYear)]);
        let set = ExistingKeySet::from_rows(
            vec![
                strings(&["000001", "2023年4季度"]),
                strings(&["000002", ""]),
                strings(&["", "2023年1季度"]),
            ],
            &fields,
            &extractors,
        );
        assert_eq!(set.len(), 1);
        assert!(set.contains(&FetchTask::new("000001", Some("2023".into()))));
        assert!(!set.contains(&FetchTask::new("000001", None)));
    }

    #[test]
    fn diff_counts_skipped() {
        let set = ExistingKeySet::from_rows(vec![strings(&["A"])], &strings(&["code"]), &BTreeMap::new());
        let plan = diff(candidate_tasks(&strings(&["A", "B", "C"]), None), Some(&set));
        assert_eq!(plan.candidates, 3);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.tasks.len(), 2);
    }

    #[test]
    fn task_params_use_configured_keys() {
        let b = BatchConfig {
            use_year: true,
            ..batch()
        };
        let params = task_params(&b, &FetchTask::new("000001", Some("2024".into())));
        assert_eq!(params["基金代码"], json!("000001"));
        assert_eq!(params["year"], json!("2024"));
    }

    proptest! {
        #[test]
        fn diff_never_keeps_existing_tasks(
            codes in proptest::collection::hash_set("[0-9]{3}", 1..20),
            existing in proptest::collection::vec(("[0-9]{3}", 2020..2025i32), 0..30),
        ) {
            let codes: Vec<String> = codes.into_iter().collect();
            let years = strings(&["2020", "2021", "2022", "2023", "2024"]);
            let rows: Vec<Vec<String>> = existing
                .iter()
                .map(|(c, y)| vec![c.clone(), y.to_string()])
                .collect();
            let set = ExistingKeySet::from_rows(rows, &strings(&["code", "year"]), &BTreeMap::new());
            let candidates = candidate_tasks(&codes, Some(&years));
            let plan = diff(candidates.clone(), Some(&set));

            prop_assert!(plan.tasks.iter().all(|t| !set.contains(t)));
            prop_assert_eq!(plan.tasks.len() + plan.skipped, candidates.len());
            for task in &candidates {
                if !set.contains(task) {
                    prop_assert!(plan.tasks.contains(task));
                }
            }
        }
    }
}
