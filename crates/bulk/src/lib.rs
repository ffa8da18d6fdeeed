//! The bulk actions engine.
//!
//! - [`ScanCursorIterator`]: lazy, shard-sequential key batches.
//! - [`executor`]: turns a batch into pipelined commands and per-item outcomes.
//! - [`BulkAction`]: one cancellable run with a live overview.
//! - [`BulkActionRegistry`]: creation, lookup, abort and eviction of runs.
//! - [`ReportStreamer`]: the optional line-oriented execution report.

pub mod action;
pub mod config;
pub mod error;
pub mod executor;
pub mod registry;
pub mod report;
pub mod scan;

pub use action::BulkAction;
pub use config::{BulkConfig, RetryPolicy};
pub use error::RunError;
pub use executor::BatchFailure;
pub use registry::{BulkActionRegistry, ReportDownload};
pub use report::ReportStreamer;
pub use scan::{KeyBatch, ScanCursorIterator};
