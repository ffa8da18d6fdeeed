/// Whole-call failures of a key-value client.
///
/// Per-command server errors (e.g. `WRONGTYPE`, `NOPERM`) are not
/// represented here; they come back inside a pipeline as
/// [`CommandOutcome`](crate::client::CommandOutcome) values.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The server is unreachable or the connection broke mid-exchange.
    #[error("Connection to {addr} failed: {message}")]
    Connection { addr: String, message: String },

    /// The server sent something the client could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected a call whose reply the client depends on
    /// (e.g. `SCAN`, `DBSIZE`, `CLUSTER SLOTS`).
    #[error("Server error: {0}")]
    Server(String),

    #[error("Unknown shard: {0}")]
    UnknownShard(String),

    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    #[error("Invalid database url: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed: the connection broke or
    /// a reply was garbled. Rejections and configuration errors are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection { .. } | StoreError::Protocol(_))
    }

    pub(crate) fn connection(addr: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Connection {
            addr: addr.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_and_protocol_errors_are_transient() {
        assert!(StoreError::connection("memory-0", "reset").is_transient());
        assert!(StoreError::Protocol("bad frame".into()).is_transient());
        assert!(!StoreError::Server("ERR syntax error".into()).is_transient());
        assert!(!StoreError::UnknownShard("memory-9".into()).is_transient());
        assert!(!StoreError::UnknownDatabase("nope".into()).is_transient());
    }
}
