//! Domain types shared by the kvdesk crates.
//!
//! Pure data and formatting only: no I/O, no async.

pub mod bulk_action;
pub mod bulk_events;
pub mod error;
pub mod report;
pub mod types;
pub mod upload;
