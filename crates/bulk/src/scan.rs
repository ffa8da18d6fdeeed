//! Shard-sequential cursor scan.
//!
//! Shards are scanned one after another; a shard is finished when the server
//! returns cursor `0`. Transient scan failures (see
//! [`StoreError::is_transient`](kvdesk_store::StoreError::is_transient)) are
//! retried with exponential backoff before the iterator gives up with
//! [`RunError::ScanExhausted`]. Any other failure ends the scan at once.

use std::collections::VecDeque;
use std::sync::Arc;

use kvdesk_core::bulk_action::BulkActionFilter;
use kvdesk_store::{KeyValueClient, ScanOptions, ScanPage, ShardId};

use crate::config::RetryPolicy;
use crate::error::RunError;

/// Keys returned by one scan call, tagged with their shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBatch {
    pub shard: ShardId,
    pub keys: Vec<String>,
}

/// Lazy, finite, non-restartable sequence of [`KeyBatch`]es.
pub struct ScanCursorIterator {
    client: Arc<dyn KeyValueClient>,
    options: ScanOptions,
    retry: RetryPolicy,
    pending: VecDeque<ShardId>,
    cursor: u64,
}

impl ScanCursorIterator {
    pub fn new(
        client: Arc<dyn KeyValueClient>,
        filter: &BulkActionFilter,
        count: u32,
        retry: RetryPolicy,
    ) -> Self {
        let pending = client.shards().into();
        Self {
            client,
            options: ScanOptions {
                pattern: filter.pattern.clone(),
                count,
                key_type: filter.key_type,
            },
            retry,
            pending,
            cursor: 0,
        }
    }

    /// The next page of keys, or `None` once every shard is exhausted.
    ///
    /// Pages may be empty: servers are allowed to return no matches for a
    /// non-zero cursor, and surfacing those pages keeps batch boundaries
    /// (and therefore cancellation) regular on sparse keyspaces.
    pub async fn next_batch(&mut self) -> Result<Option<KeyBatch>, RunError> {
        let Some(shard) = self.pending.front().cloned() else {
            return Ok(None);
        };

        let page = self.scan_with_retry(&shard).await?;
        if page.cursor == 0 {
            tracing::debug!(shard = %shard, "Shard scan finished");
            self.pending.pop_front();
            self.cursor = 0;
        } else {
            self.cursor = page.cursor;
        }

        Ok(Some(KeyBatch {
            shard,
            keys: page.keys,
        }))
    }

    async fn scan_with_retry(&self, shard: &str) -> Result<ScanPage, RunError> {
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.client.scan(shard, self.cursor, &self.options).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt <= self.retry.max_retries => {
                    tracing::warn!(
                        shard,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Scan failed, retrying",
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.retry.next_delay(delay);
                }
                Err(e) => {
                    return Err(RunError::ScanExhausted {
                        shard: shard.to_string(),
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}

/// Best-effort estimate of how many keys a scan will visit: the summed key
/// counts of all shards. Shards that fail to answer count as zero.
pub async fn estimate_total(client: &dyn KeyValueClient) -> u64 {
    let mut total = 0u64;
    for shard in client.shards() {
        match client.db_size(&shard).await {
            Ok(n) => total = total.saturating_add(n),
            Err(e) => tracing::warn!(shard = %shard, error = %e, "Failed to read shard size"),
        }
    }
    total
}
