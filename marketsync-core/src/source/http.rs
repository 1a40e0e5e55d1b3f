//! HTTP source client for an AKTools-style gateway.
//!
//! Each library function is exposed as `GET {endpoint}/{function}` with its
//! parameters in the query string; the body is a JSON array of records.
//! Retries with exponential backoff and jitter, and shares a circuit breaker
//! across all worker threads.

use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CircuitBreaker, SourceClient, SourceError};
use crate::config::SourceConfig;
use crate::field_mapper::Params;
use crate::frame::{records_to_frame, Document};
use polars::prelude::DataFrame;

/// [`SourceClient`] that calls gateway functions over blocking HTTP.
pub struct HttpSourceClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
    timeout: Duration,
}

impl HttpSourceClient {
    pub fn new(config: &SourceConfig, circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, SourceError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            circuit_breaker,
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            timeout,
        })
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self, SourceError> {
        Self::new(config, Arc::new(CircuitBreaker::for_gateway()))
    }

    fn function_url(&self, function: &str) -> String {
        format!("{}/{function}", self.endpoint)
    }

    /// Backoff for the given retry attempt (1-based), with up to 25% jitter so
    /// concurrent workers do not retry in lockstep.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay * 2u32.pow(attempt.saturating_sub(1).min(10));
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    /// Wait before a retry. A rate-limited response's `retry-after` is
    /// honoured up to the request timeout.
    fn retry_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let backoff = self.backoff(attempt);
        match retry_after_secs {
            Some(secs) => backoff.max(Duration::from_secs(secs).min(self.timeout)),
            None => backoff,
        }
    }

    fn fetch_with_retry(&self, function: &str, params: &Params) -> Result<DataFrame, SourceError> {
        if !self.circuit_breaker.allows_request() {
            return Err(SourceError::CircuitBreakerTripped);
        }

        let url = self.function_url(function);
        let mut last_error = None;
        let mut retry_after = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.retry_delay(attempt, retry_after.take()));
                if !self.circuit_breaker.allows_request() {
                    return Err(SourceError::CircuitBreakerTripped);
                }
            }

            debug!(function, attempt, ?params, "source request");
            let response = match self.client.get(&url).query(params).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(SourceError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(SourceError::NetworkUnreachable(e.to_string())),
            };

            let status = response.status();
            match status {
                StatusCode::NOT_FOUND => {
                    return Err(SourceError::UnknownFunction(function.to_string()));
                }
                StatusCode::FORBIDDEN => {
                    self.circuit_breaker.trip();
                    return Err(SourceError::CircuitBreakerTripped);
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    self.circuit_breaker.record_failure();
                    let wait_secs = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok())
                        .unwrap_or(60);
                    warn!(function, retry_after = wait_secs, attempt, "source rate limited");
                    retry_after = Some(wait_secs);
                    last_error = Some(SourceError::RateLimited {
                        retry_after_secs: wait_secs,
                    });
                    continue;
                }
                s if !s.is_success() => {
                    self.circuit_breaker.record_failure();
                    warn!(function, status = %s, attempt, "source returned an error status");
                    last_error = Some(SourceError::Other(format!("HTTP {s} for {function}")));
                    continue;
                }
                _ => {}
            }

            let body: Value = response.json().map_err(|e| {
                SourceError::ResponseFormatChanged(format!("{function}: body is not JSON: {e}"))
            })?;
            let df = parse_records(function, body)?;
            self.circuit_breaker.record_success();
            return Ok(df);
        }

        Err(last_error.unwrap_or_else(|| SourceError::Other("max retries exceeded".into())))
    }
}

/// A gateway body is a JSON array of flat records; `null` means no rows.
fn parse_records(function: &str, body: Value) -> Result<DataFrame, SourceError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => {
            return Err(SourceError::ResponseFormatChanged(format!(
                "{function}: expected an array of records, got {}",
                json_kind(&other)
            )))
        }
    };
    let records = items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(SourceError::ResponseFormatChanged(format!(
                "{function}: record is {}, not an object",
                json_kind(&other)
            ))),
        })
        .collect::<Result<Vec<Document>, _>>()?;
    records_to_frame(&records)
        .map_err(|e| SourceError::ResponseFormatChanged(format!("{function}: {e}")))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl SourceClient for HttpSourceClient {
    fn name(&self) -> &str {
        "aktools_http"
    }

    fn call(&self, function: &str, params: &Params) -> Result<DataFrame, SourceError> {
        self.fetch_with_retry(function, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn array_body_becomes_frame() {
        let df = parse_records(
            "fund_name_em",
            json!([{"基金代码": "000001", "基金简称": "华夏成长"}, {"基金代码": "000003"}]),
        )
        .unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 2);
    }

    #[test]
    fn null_body_is_empty() {
        let df = parse_records("f", Value::Null).unwrap();
        assert_eq!(df.height(), 0);
    }

    #[test]
    fn object_body_is_format_change() {
        let err = parse_records("f", json!({"error": "boom"})).unwrap_err();
        assert!(matches!(err, SourceError::ResponseFormatChanged(_)));
        let err = parse_records("f", json!([1, 2])).unwrap_err();
        assert!(matches!(err, SourceError::ResponseFormatChanged(_)));
    }

    #[test]
    fn rate_limit_wait_is_capped_by_timeout() {
        let config = SourceConfig {
            retry_base_delay_ms: 100,
            timeout_secs: 5,
            ..SourceConfig::default()
        };
        let client = HttpSourceClient::from_config(&config).unwrap();
        assert_eq!(client.retry_delay(1, Some(2)), Duration::from_secs(2));
        assert_eq!(client.retry_delay(1, Some(120)), Duration::from_secs(5));
        assert!(client.retry_delay(1, None) <= Duration::from_millis(125));
        assert!(client.retry_delay(1, Some(0)) >= Duration::from_millis(100));
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let config = SourceConfig {
            retry_base_delay_ms: 100,
            ..SourceConfig::default()
        };
        let client = HttpSourceClient::from_config(&config).unwrap();
        assert!(client.backoff(1) >= Duration::from_millis(100));
        assert!(client.backoff(1) <= Duration::from_millis(125));
        assert!(client.backoff(3) >= Duration::from_millis(400));
    }

    #[test]
    fn url_joins_endpoint_and_function() {
        let config = SourceConfig {
            endpoint: "http://localhost:8080/api/public/".into(),
            ..SourceConfig::default()
        };
        let client = HttpSourceClient::from_config(&config).unwrap();
        assert_eq!(
            client.function_url("stock_zh_a_hist"),
            "http://localhost:8080/api/public/stock_zh_a_hist"
        );
    }

    #[test]
    fn open_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(60), 1));
        breaker.trip();
        let client = HttpSourceClient::new(&SourceConfig::default(), breaker).unwrap();
        let err = client.call("fund_name_em", &Params::new()).unwrap_err();
        assert!(matches!(err, SourceError::CircuitBreakerTripped));
    }
}
