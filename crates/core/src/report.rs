//! Bulk action report format.
//!
//! A report is plain text, one line per processed item followed by a single
//! summary line:
//!
//! ```text
//! <key>\t<OK|ERROR>\t<error-or-empty>
//! #summary\tstatus=<status>\tprocessed=<n>\tsucceed=<n>\tfailed=<n>\tduration_ms=<n>[\terror=<msg>]
//! ```
//!
//! Backslash, tab, CR and LF inside keys and messages are escaped so every
//! record stays on exactly one line.

use chrono::DateTime;

use crate::bulk_action::{BulkActionOverview, BulkActionType};

/// Content type of a downloaded report.
pub const REPORT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Status column for an item that succeeded.
pub const REPORT_STATUS_OK: &str = "OK";
/// Status column for an item that failed.
pub const REPORT_STATUS_ERROR: &str = "ERROR";

/// Prefix of the trailing summary line.
pub const SUMMARY_PREFIX: &str = "#summary";

/// Escape a field so it cannot break the line/column structure.
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Format one item result line, including the trailing newline.
pub fn result_line(key: &str, error: Option<&str>) -> String {
    match error {
        None => format!("{}\t{REPORT_STATUS_OK}\t\n", escape_field(key)),
        Some(message) => format!(
            "{}\t{REPORT_STATUS_ERROR}\t{}\n",
            escape_field(key),
            escape_field(message)
        ),
    }
}

/// Format the trailing summary line for a terminal overview.
pub fn summary_line(overview: &BulkActionOverview) -> String {
    let summary = &overview.summary;
    let mut line = format!(
        "{SUMMARY_PREFIX}\tstatus={}\tprocessed={}\tsucceed={}\tfailed={}\tduration_ms={}",
        overview.status.as_str(),
        summary.processed,
        summary.succeed,
        summary.failed,
        overview.duration,
    );
    if let Some(error) = &overview.error {
        line.push_str("\terror=");
        line.push_str(&escape_field(error));
    }
    line.push('\n');
    line
}

/// Download filename for a report, derived from the action id interpreted
/// as a creation timestamp in Unix milliseconds.
///
/// `1700000000123` becomes `bulk-delete-report-2023-11-14T22-13-20-123Z.txt`.
/// Ids that are not timestamps are used verbatim.
pub fn report_filename(action_type: BulkActionType, id: &str) -> String {
    let stamp = id
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|ts| {
            ts.format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string()
                .replace([':', '.'], "-")
        })
        .unwrap_or_else(|| id.to_string());
    format!("bulk-{}-report-{stamp}.txt", action_type.as_str())
}
