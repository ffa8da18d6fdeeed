//! The key-value client abstraction consumed by the bulk engine.
//!
//! A client exposes the keyspace as a list of shards (one entry for a
//! standalone server, one per master in a cluster), incremental cursor
//! scans per shard, and pipelined command execution per shard.

use async_trait::async_trait;
use kvdesk_core::bulk_action::KeyType;

use crate::error::StoreError;

/// Identity of one independently scanned partition (usually `host:port`).
pub type ShardId = String;

/// A single command: name plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build a command from tokenized CLI parts. `None` for empty input.
    pub fn from_parts(mut parts: Vec<String>) -> Option<Self> {
        if parts.is_empty() {
            return None;
        }
        let name = parts.remove(0);
        Some(Self { name, args: parts })
    }

    /// The key a command operates on, by convention its first argument.
    pub fn key(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

/// A successful server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
}

/// Result of one command inside a pipeline: the reply, or the server's
/// error message.
pub type CommandOutcome = Result<Reply, String>;

/// Options shared by every scan call of one iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub pattern: String,
    pub count: u32,
    pub key_type: Option<KeyType>,
}

/// One page of an incremental scan. A `cursor` of `0` means the shard is
/// exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Client for one logical database, possibly sharded.
///
/// Implementations must tolerate concurrent use from several bulk actions.
impl std::fmt::Debug for dyn KeyValueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueClient").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait KeyValueClient: Send + Sync {
    /// Shards to scan, in a stable order.
    fn shards(&self) -> Vec<ShardId>;

    /// Shard that owns `key`.
    fn route(&self, key: &str) -> ShardId;

    /// Number of keys held by a shard.
    async fn db_size(&self, shard: &str) -> Result<u64, StoreError>;

    /// One `SCAN` step on a shard.
    async fn scan(
        &self,
        shard: &str,
        cursor: u64,
        options: &ScanOptions,
    ) -> Result<ScanPage, StoreError>;

    /// Execute `commands` on a shard as one pipeline.
    ///
    /// On success the result holds exactly one outcome per command, in
    /// order. An `Err` means the pipeline as a whole could not be executed.
    async fn pipeline(
        &self,
        shard: &str,
        commands: &[Command],
    ) -> Result<Vec<CommandOutcome>, StoreError>;
}
