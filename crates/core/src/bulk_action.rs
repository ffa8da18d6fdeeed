//! Bulk action domain types.
//!
//! A bulk action is one run of a mass operation (delete-by-pattern or
//! upload) against a key-value database. [`BulkActionOverview`] is the
//! externally visible snapshot of a run; the engine in `kvdesk-bulk`
//! owns and mutates it, everything else only ever sees copies.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::{ActionId, DatabaseId};

/// Scan pattern used when the caller does not supply one.
pub const DEFAULT_MATCH_PATTERN: &str = "*";

/// Default cap on `summary.errors`.
pub const DEFAULT_MAX_SUMMARY_ERRORS: usize = 500;

/// Default cap on `summary.keys`.
pub const DEFAULT_MAX_SUMMARY_KEYS: usize = 500;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Kind of mass operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkActionType {
    Delete,
    Upload,
}

impl BulkActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkActionType::Delete => "delete",
            BulkActionType::Upload => "upload",
        }
    }
}

/// Lifecycle status of a bulk action.
///
/// `Running` is the only initial state; the other three are terminal and
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkActionStatus {
    Running,
    Completed,
    Aborted,
    Failed,
}

impl BulkActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkActionStatus::Running => "running",
            BulkActionStatus::Completed => "completed",
            BulkActionStatus::Aborted => "aborted",
            BulkActionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BulkActionStatus::Running)
    }
}

/// Server-side value type used to restrict a scan (`SCAN ... TYPE <t>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "hash")]
    Hash,
    #[serde(rename = "list")]
    List,
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "zset")]
    Zset,
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "ReJSON-RL")]
    Json,
}

impl KeyType {
    /// The type name as the server reports it from `TYPE` and accepts in
    /// `SCAN ... TYPE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::Zset => "zset",
            KeyType::Stream => "stream",
            KeyType::Json => "ReJSON-RL",
        }
    }
}

// ---------------------------------------------------------------------------
// Filter / progress / summary
// ---------------------------------------------------------------------------

fn default_match() -> String {
    DEFAULT_MATCH_PATTERN.to_string()
}

/// Scan pattern plus optional type restriction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BulkActionFilter {
    #[serde(rename = "match", default = "default_match")]
    #[validate(length(min = 1, message = "match pattern must not be empty"))]
    pub pattern: String,

    #[serde(rename = "type", default)]
    pub key_type: Option<KeyType>,
}

impl Default for BulkActionFilter {
    fn default() -> Self {
        Self {
            pattern: default_match(),
            key_type: None,
        }
    }
}

/// `scanned` never decreases; `total` is a best-effort estimate and may be
/// exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkActionProgress {
    pub scanned: u64,
    pub total: u64,
}

/// A per-key failure recorded in the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkActionItemError {
    pub key: String,
    pub message: String,
}

/// Caps applied to the unbounded parts of a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryLimits {
    pub max_errors: usize,
    pub max_keys: usize,
}

impl Default for SummaryLimits {
    fn default() -> Self {
        Self {
            max_errors: DEFAULT_MAX_SUMMARY_ERRORS,
            max_keys: DEFAULT_MAX_SUMMARY_KEYS,
        }
    }
}

/// Accumulated per-item results.
///
/// `processed == succeed + failed` holds after every `record_*` call.
/// `errors` and `keys` keep their earliest entries and stop growing once
/// their cap is reached; the counters keep counting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkActionSummary {
    pub processed: u64,
    pub succeed: u64,
    pub failed: u64,
    pub errors: Vec<BulkActionItemError>,
    pub keys: Vec<String>,
}

impl BulkActionSummary {
    pub fn record_success(&mut self, key: &str, limits: SummaryLimits) {
        self.processed += 1;
        self.succeed += 1;
        if self.keys.len() < limits.max_keys {
            self.keys.push(key.to_string());
        }
    }

    pub fn record_failure(&mut self, key: &str, message: &str, limits: SummaryLimits) {
        self.processed += 1;
        self.failed += 1;
        if self.errors.len() < limits.max_errors {
            self.errors.push(BulkActionItemError {
                key: key.to_string(),
                message: message.to_string(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

/// Externally visible snapshot of one bulk action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkActionOverview {
    pub id: ActionId,
    pub database_id: DatabaseId,
    #[serde(rename = "type")]
    pub action_type: BulkActionType,
    pub filter: BulkActionFilter,
    pub status: BulkActionStatus,
    pub progress: BulkActionProgress,
    pub summary: BulkActionSummary,
    /// Milliseconds since start; frozen once the action is terminal.
    pub duration: u64,
    /// Fatal error of a `failed` run, distinct from per-key errors.
    pub error: Option<String>,
}

impl BulkActionOverview {
    /// Initial overview of a freshly started action.
    pub fn new(
        id: ActionId,
        database_id: DatabaseId,
        action_type: BulkActionType,
        filter: BulkActionFilter,
    ) -> Self {
        Self {
            id,
            database_id,
            action_type,
            filter,
            status: BulkActionStatus::Running,
            progress: BulkActionProgress::default(),
            summary: BulkActionSummary::default(),
            duration: 0,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Create request
// ---------------------------------------------------------------------------

/// Type-specific payload of an upload action: one command line per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct UploadPayload {
    #[validate(length(min = 1, message = "upload requires at least one command"))]
    pub commands: Vec<String>,
}

/// Parameters for creating a bulk action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBulkAction {
    #[validate(length(min = 1, message = "databaseId must not be empty"))]
    pub database_id: DatabaseId,

    #[serde(rename = "type")]
    pub action_type: BulkActionType,

    #[serde(default)]
    #[validate(nested)]
    pub filter: BulkActionFilter,

    #[serde(default)]
    pub report_enabled: bool,

    #[serde(default)]
    #[validate(nested)]
    pub upload: Option<UploadPayload>,
}

impl CreateBulkAction {
    /// Field validation plus the cross-field rules between `type` and the
    /// upload payload.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()?;
        match (self.action_type, &self.upload) {
            (BulkActionType::Upload, None) => Err(CoreError::Validation(
                "upload actions require an upload payload".into(),
            )),
            (BulkActionType::Delete, Some(_)) => Err(CoreError::Validation(
                "delete actions do not accept an upload payload".into(),
            )),
            _ => Ok(()),
        }
    }
}
