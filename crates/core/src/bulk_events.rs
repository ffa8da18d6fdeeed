//! WebSocket message type constants for bulk action traffic.
//!
//! Used by the engine when publishing progress events and by the API when
//! framing replies to WebSocket clients.

/// Progress snapshot of a running bulk action.
pub const MSG_TYPE_BULK_ACTION_OVERVIEW: &str = "bulk_action_overview";

/// Final snapshot after a bulk action reached a terminal state.
pub const MSG_TYPE_BULK_ACTION_FINISHED: &str = "bulk_action_finished";

/// Sent once per connection, carrying the channel id clients use in
/// `x-channel-id` headers.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Error reply to an inbound WebSocket request.
pub const MSG_TYPE_ERROR: &str = "error";

/// Inbound request: create a bulk action.
pub const MSG_TYPE_CREATE: &str = "create";

/// Inbound request: fetch an overview.
pub const MSG_TYPE_GET: &str = "get";

/// Inbound request: abort a bulk action.
pub const MSG_TYPE_ABORT: &str = "abort";
