use kvdesk_store::StoreError;

/// Fatal error of one bulk action run.
///
/// Per-item failures never produce a `RunError`; they are counted in the
/// summary. A `RunError` ends the run with status `failed` and its message
/// becomes the overview's `error`.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Database {database_id} is unavailable: {source}")]
    Client {
        database_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Scan of shard {shard} failed after {attempts} attempts: {source}")]
    ScanExhausted {
        shard: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Batch on shard {shard} failed: {source}")]
    Pipeline {
        shard: String,
        #[source]
        source: StoreError,
    },
}
