//! Source clients: the function-name-keyed interface to the data library.
//!
//! The engine only knows [`SourceClient`]. Implementations:
//! - [`HttpSourceClient`]: AKTools-style HTTP gateway (`GET {endpoint}/{function}`)
//! - [`CsvDirClient`]: one CSV file per function, for offline runs and fixtures

pub mod circuit_breaker;
pub mod csv_dir;
pub mod http;

use polars::prelude::DataFrame;
use thiserror::Error;

use crate::field_mapper::Params;

pub use circuit_breaker::CircuitBreaker;
pub use csv_dir::CsvDirClient;
pub use http::HttpSourceClient;

/// Errors from a source call.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source function: {0}")]
    UnknownFunction(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("hard stop: source is refusing requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("source I/O error: {0}")]
    Io(String),

    #[error("source error: {0}")]
    Other(String),
}

/// Calls a named function of the data library.
///
/// Implementations must be callable from many worker threads at once. An
/// empty frame is a valid answer, not an error.
pub trait SourceClient: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn call(&self, function: &str, params: &Params) -> Result<DataFrame, SourceError>;
}

impl<T: SourceClient + ?Sized> SourceClient for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn call(&self, function: &str, params: &Params) -> Result<DataFrame, SourceError> {
        (**self).call(function, params)
    }
}
