//! In-process publication of bulk action progress.
//!
//! The bulk engine publishes a [`BulkActionEvent`] on every overview change;
//! the API layer subscribes and forwards each event to the WebSocket
//! connection that owns the action.

pub mod bus;

pub use bus::{BulkActionEvent, EventBus};
