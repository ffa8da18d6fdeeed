//! Periodic eviction of terminal bulk actions.
//!
//! Actions that have been `completed`, `aborted` or `failed` for at least
//! the configured TTL are dropped from the registry. Running actions are
//! never touched.

use std::sync::Arc;
use std::time::Duration;

use kvdesk_bulk::BulkActionRegistry;
use tokio_util::sync::CancellationToken;

/// Run the reaper loop until `cancel` is triggered.
pub async fn run(
    registry: Arc<BulkActionRegistry>,
    ttl: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        ttl_secs = ttl.as_secs(),
        interval_secs = every.as_secs(),
        "Bulk action reaper started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Bulk action reaper stopping");
                break;
            }
            _ = interval.tick() => {
                let evicted = registry.evict_expired(ttl).await;
                if evicted > 0 {
                    tracing::info!(evicted, "Evicted expired bulk actions");
                } else {
                    tracing::trace!("No expired bulk actions");
                }
            }
        }
    }
}
