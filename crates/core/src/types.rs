/// Bulk action identifiers are creation timestamps (Unix milliseconds)
/// rendered as decimal strings.
pub type ActionId = String;

/// Identity of the client channel (WebSocket connection) that issued a request.
pub type ChannelId = String;

/// Identity of a configured key-value database.
pub type DatabaseId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
