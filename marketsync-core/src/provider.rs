//! Providers: a collection descriptor plus the fetch step built on it.
//!
//! The default [`Provider::fetch`] is the whole per-call pipeline: map and
//! validate caller parameters, call the source, backfill parameter columns
//! and stamp the scrape time. Collections that need more override it.

use chrono::Local;
use polars::prelude::DataFrame;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::descriptor::CollectionDescriptor;
use crate::engine::plan::{self, FetchTask};
use crate::error::SyncError;
use crate::field_mapper::{FieldMapper, Params, RawParams};
use crate::frame::{backfill_param_columns, stamp_timestamp, Document};
use crate::source::SourceClient;

/// Field every stored document carries with the source function name.
pub const API_NAME_FIELD: &str = "api_name";

/// Rows from one source call together with the parameters that produced them.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub frame: DataFrame,
    pub params: Params,
}

impl Fetched {
    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }
}

pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &CollectionDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Caller parameters for one batch task.
    fn batch_params(&self, task: &FetchTask) -> RawParams {
        match &self.descriptor().batch {
            Some(batch) => plan::task_params(batch, task),
            None => RawParams::new(),
        }
    }

    fn fetch(&self, client: &dyn SourceClient, raw: &RawParams) -> Result<Fetched, SyncError> {
        let descriptor = self.descriptor();
        let params = FieldMapper::new(descriptor).map_and_validate(raw)?;
        let frame = client
            .call(descriptor.function(), &params)
            .map_err(|source| SyncError::SourceCallFailure {
                task: format!("{}({})", descriptor.function(), describe(&params)),
                source,
            })?;
        if frame.height() == 0 {
            return Ok(Fetched { frame, params });
        }
        let frame = backfill_param_columns(frame, &descriptor.add_param_columns, &params, &descriptor.name)?;
        let frame = stamp_timestamp(frame, &descriptor.timestamp_field, Local::now())?;
        Ok(Fetched { frame, params })
    }

    /// Fields merged into every stored document of this collection.
    fn extra_fields(&self, metadata: &BTreeMap<String, String>) -> Document {
        let mut fields: Document = metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        fields.insert(
            API_NAME_FIELD.to_string(),
            Value::String(self.descriptor().function().to_string()),
        );
        fields
    }
}

fn describe(params: &Params) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A provider that is nothing but its descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorProvider {
    descriptor: CollectionDescriptor,
}

impl DescriptorProvider {
    pub fn new(descriptor: CollectionDescriptor) -> Self {
        Self { descriptor }
    }
}

impl Provider for DescriptorProvider {
    fn descriptor(&self) -> &CollectionDescriptor {
        &self.descriptor
    }
}

impl From<CollectionDescriptor> for DescriptorProvider {
    fn from(descriptor: CollectionDescriptor) -> Self {
        Self::new(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::BatchConfig;
    use crate::frame::{column_strings, records_to_frame};
    use crate::source::SourceError;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording {
        calls: Mutex<Vec<(String, Params)>>,
        rows: Vec<Document>,
    }

    impl SourceClient for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn call(&self, function: &str, params: &Params) -> Result<DataFrame, SourceError> {
            self.calls
                .lock()
                .unwrap()
                .push((function.to_string(), params.clone()));
            records_to_frame(&self.rows).map_err(|e| SourceError::Other(e.to_string()))
        }
    }

    fn holdings() -> DescriptorProvider {
        DescriptorProvider::new(CollectionDescriptor {
            parameter_aliases: vec![
                ("fund_code".into(), "symbol".into()),
                ("基金代码".into(), "symbol".into()),
                ("year".into(), "date".into()),
            ],
            required_params: vec!["symbol".into(), "date".into()],
            add_param_columns: vec![("symbol".into(), "基金代码".into())],
            batch: Some(BatchConfig {
                use_year: true,
                ..BatchConfig::from_source("fund_name_em", "基金代码")
            }),
            ..CollectionDescriptor::new("fund_portfolio_hold_em")
        })
    }

    #[test]
    fn fetch_maps_calls_backfills_and_stamps() {
        let client = Recording {
            calls: Mutex::new(Vec::new()),
            rows: vec![json!({"股票代码": "600519"}).as_object().cloned().unwrap()],
        };
        let provider = holdings();
        let raw = provider.batch_params(&FetchTask::new("000001", Some("2024".into())));
        let fetched = provider.fetch(&client, &raw).unwrap();

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].0, "fund_portfolio_hold_em");
        assert_eq!(calls[0].1["symbol"], "000001");
        assert_eq!(calls[0].1["date"], "2024");
        assert_eq!(
            column_strings(&fetched.frame, "基金代码").unwrap(),
            vec![Some("000001".into())]
        );
        assert!(fetched.frame.column("scraped_at").is_ok());
    }

    #[test]
    fn missing_params_never_reach_the_source() {
        let client = Recording {
            calls: Mutex::new(Vec::new()),
            rows: Vec::new(),
        };
        let err = holdings()
            .fetch(&client, &RawParams::from([("fund_code".into(), json!("000001"))]))
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingParameter(ref m) if m == &vec!["date".to_string()]));
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_result_is_returned_untouched() {
        let client = Recording {
            calls: Mutex::new(Vec::new()),
            rows: Vec::new(),
        };
        let raw = RawParams::from([("fund_code".into(), json!("1")), ("year".into(), json!("2024"))]);
        let fetched = holdings().fetch(&client, &raw).unwrap();
        assert!(fetched.is_empty());
        assert_eq!(fetched.frame.width(), 0);
    }

    #[test]
    fn extra_fields_carry_api_name() {
        let metadata = BTreeMap::from([("data_source".to_string(), "akshare".to_string())]);
        let fields = holdings().extra_fields(&metadata);
        assert_eq!(fields["data_source"], json!("akshare"));
        assert_eq!(fields[API_NAME_FIELD], json!("fund_portfolio_hold_em"));
    }
}
