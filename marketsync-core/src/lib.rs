//! MarketSync Core: generic incremental batch sync of market-data collections.
//!
//! This crate contains everything between a caller asking for a collection
//! and the rows landing in a document store:
//! - Declarative collection descriptors and the registry that discovers them
//! - Caller parameter mapping and validation
//! - Source clients (HTTP gateway, CSV directory)
//! - Document stores (in-memory, JSON files)
//! - The sync engine: single call, full fetch, and incremental batch runs
//!   with bounded concurrency and a single aggregating writer
//! - Progress sinks and an in-memory task tracker

pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod field_mapper;
pub mod frame;
pub mod progress;
pub mod provider;
pub mod registry;
pub mod service;
pub mod source;
pub mod store;

pub use config::SyncConfig;
pub use descriptor::{BatchConfig, CollectionDescriptor, FieldInfo};
pub use engine::{RunOutcome, RunStatus, SyncEngine};
pub use error::SyncError;
pub use field_mapper::{FieldMapper, Params, RawParams};
pub use progress::ProgressSink;
pub use provider::{DescriptorProvider, Provider};
pub use registry::CollectionRegistry;
pub use source::SourceClient;
pub use store::UpsertStore;
