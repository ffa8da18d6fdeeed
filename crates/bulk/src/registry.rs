//! Registry of bulk actions.
//!
//! Two maps, mutated together under one lock:
//!
//! - `actions`: id -> action
//! - `channels`: channel id -> the id of the last action created by it
//!
//! A channel may own at most one running action; `create` on a channel
//! whose action is still running fails with [`CoreError::Conflict`].
//! Terminal actions stay queryable until [`evict_expired`] or [`remove`]
//! drops them.
//!
//! [`evict_expired`]: BulkActionRegistry::evict_expired
//! [`remove`]: BulkActionRegistry::remove

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use kvdesk_core::bulk_action::{BulkActionOverview, CreateBulkAction};
use kvdesk_core::error::CoreError;
use kvdesk_core::report::report_filename;
use kvdesk_core::types::{ActionId, ChannelId};
use kvdesk_events::EventBus;
use kvdesk_store::ClientProvider;
use tokio::sync::{mpsc, RwLock};

use crate::action::{BulkAction, RunContext};
use crate::config::BulkConfig;

const ENTITY: &str = "BulkAction";

/// A report stream ready to be served.
#[derive(Debug)]
pub struct ReportDownload {
    pub filename: String,
    pub chunks: mpsc::Receiver<Bytes>,
}

#[derive(Default)]
struct Maps {
    actions: HashMap<ActionId, Arc<BulkAction>>,
    channels: HashMap<ChannelId, ActionId>,
    last_id: u64,
}

impl Maps {
    /// Millisecond timestamp id, bumped past the previous one on collision.
    fn next_id(&mut self) -> ActionId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_id = now.max(self.last_id + 1);
        self.last_id.to_string()
    }

    fn detach_channel(&mut self, action: &BulkAction) {
        if self.channels.get(action.channel_id()).map(String::as_str) == Some(action.id()) {
            self.channels.remove(action.channel_id());
        }
    }
}

pub struct BulkActionRegistry {
    maps: RwLock<Maps>,
    ctx: RunContext,
}

impl BulkActionRegistry {
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        events: Arc<EventBus>,
        config: Arc<BulkConfig>,
    ) -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            ctx: RunContext {
                provider,
                events,
                config,
            },
        }
    }

    pub fn config(&self) -> &BulkConfig {
        &self.ctx.config
    }

    /// Validate `params`, then start a new action owned by `channel_id`.
    ///
    /// Failures during the run never surface here; they show up as a
    /// `failed` overview on later reads.
    pub async fn create(
        &self,
        channel_id: &str,
        params: CreateBulkAction,
    ) -> Result<BulkActionOverview, CoreError> {
        params.check()?;
        if !self.ctx.provider.contains(&params.database_id) {
            return Err(CoreError::NotFound {
                entity: "Database",
                id: params.database_id,
            });
        }

        let mut maps = self.maps.write().await;

        if let Some(existing) = maps
            .channels
            .get(channel_id)
            .and_then(|id| maps.actions.get(id))
        {
            if existing.is_running() {
                return Err(CoreError::Conflict(format!(
                    "Channel {channel_id} already has running bulk action {}",
                    existing.id()
                )));
            }
        }

        let id = maps.next_id();
        let action = BulkAction::start(
            id.clone(),
            channel_id.to_string(),
            params,
            self.ctx.clone(),
        );
        let overview = action.overview();

        maps.actions.insert(id.clone(), action);
        maps.channels.insert(channel_id.to_string(), id);
        Ok(overview)
    }

    pub async fn get(&self, id: &str) -> Result<BulkActionOverview, CoreError> {
        Ok(self.action(id).await?.overview())
    }

    /// Request abort. Safe to call repeatedly and on terminal actions.
    pub async fn abort(&self, id: &str) -> Result<BulkActionOverview, CoreError> {
        Ok(self.action(id).await?.abort())
    }

    /// Abort (if still running) and evict immediately.
    pub async fn remove(&self, id: &str) -> Result<BulkActionOverview, CoreError> {
        let mut maps = self.maps.write().await;
        let action = maps.actions.remove(id).ok_or_else(|| not_found(id))?;
        maps.detach_channel(&action);
        drop(maps);

        tracing::info!(action_id = %id, "Bulk action removed");
        Ok(action.abort())
    }

    /// Implicit cancellation when the owning transport channel goes away.
    ///
    /// Aborts the channel's action and forgets the channel; the action
    /// itself stays until evicted.
    pub async fn on_channel_disconnect(&self, channel_id: &str) -> Option<BulkActionOverview> {
        let mut maps = self.maps.write().await;
        let id = maps.channels.remove(channel_id)?;
        let action = maps.actions.get(&id).cloned()?;
        drop(maps);

        if action.is_running() {
            tracing::info!(
                action_id = %id,
                channel_id,
                "Channel disconnected, aborting bulk action",
            );
        }
        Some(action.abort())
    }

    /// Attach the report reader of an action.
    ///
    /// `NotFound` for unknown ids, `BadRequest` when the action was created
    /// without `reportEnabled`, `Conflict` when a reader is already attached.
    pub async fn stream_report(&self, id: &str) -> Result<ReportDownload, CoreError> {
        let action = self.action(id).await?;
        let report = action.report().ok_or_else(|| {
            CoreError::BadRequest(format!("Report is not enabled for bulk action {id}"))
        })?;

        let chunks = report.attach().await?;
        let filename = report_filename(action.overview().action_type, id);
        Ok(ReportDownload { filename, chunks })
    }

    /// Drop actions that have been terminal for at least `ttl`. Returns the
    /// number evicted.
    pub async fn evict_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut maps = self.maps.write().await;

        let expired: Vec<Arc<BulkAction>> = maps
            .actions
            .values()
            .filter(|a| {
                a.finished_at()
                    .is_some_and(|at| now.saturating_duration_since(at) >= ttl)
            })
            .cloned()
            .collect();

        for action in &expired {
            maps.actions.remove(action.id());
            maps.detach_channel(action);
        }
        expired.len()
    }

    /// Abort every running action. Used at shutdown.
    pub async fn abort_all(&self) -> usize {
        let maps = self.maps.read().await;
        let running: Vec<&Arc<BulkAction>> =
            maps.actions.values().filter(|a| a.is_running()).collect();
        for action in &running {
            action.abort();
        }
        running.len()
    }

    /// Wait for an action to reach a terminal state.
    pub async fn wait(&self, id: &str) -> Result<BulkActionOverview, CoreError> {
        Ok(self.action(id).await?.wait().await)
    }

    pub async fn len(&self) -> usize {
        self.maps.read().await.actions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Handle of a registered action.
    pub async fn action(&self, id: &str) -> Result<Arc<BulkAction>, CoreError> {
        self.maps
            .read()
            .await
            .actions
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }
}

fn not_found(id: &str) -> CoreError {
    CoreError::NotFound {
        entity: ENTITY,
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let mut maps = Maps::default();
        let ids: Vec<u64> = (0..100)
            .map(|_| maps.next_id().parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn ids_are_millisecond_timestamps() {
        let mut maps = Maps::default();
        let id: u64 = maps.next_id().parse().unwrap();
        // 2020-01-01T00:00:00Z
        assert!(id > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn not_found_names_the_id() {
        let registry = BulkActionRegistry::new(
            Arc::new(kvdesk_store::StaticClientProvider::new()),
            Arc::new(EventBus::default()),
            Arc::new(BulkConfig::default()),
        );
        assert_matches!(
            registry.get("42").await,
            Err(CoreError::NotFound { entity: "BulkAction", id }) if id == "42"
        );
    }
}
