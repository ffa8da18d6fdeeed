//! Key-value store access for bulk actions: the client trait, an in-process
//! sharded store, a RESP2 client for real servers, and database resolution.

pub mod client;
pub mod error;
pub mod glob;
pub mod memory;
pub mod provider;
pub mod resp;
pub mod slots;

pub use client::{Command, CommandOutcome, KeyValueClient, Reply, ScanOptions, ScanPage, ShardId};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use provider::{ClientProvider, DatabaseUrl, StaticClientProvider};
pub use resp::{Credentials, RespClient};
