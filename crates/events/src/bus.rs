//! Event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the bulk engine
//! (publisher) and the WebSocket forwarder (subscriber).

use chrono::{DateTime, Utc};
use kvdesk_core::bulk_action::BulkActionOverview;
use kvdesk_core::bulk_events::{MSG_TYPE_BULK_ACTION_FINISHED, MSG_TYPE_BULK_ACTION_OVERVIEW};
use kvdesk_core::types::ChannelId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// BulkActionEvent
// ---------------------------------------------------------------------------

/// A change in the state of a bulk action, addressed to the channel that
/// created it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkActionEvent {
    /// [`MSG_TYPE_BULK_ACTION_OVERVIEW`] or [`MSG_TYPE_BULK_ACTION_FINISHED`].
    pub event_type: String,

    /// Channel that owns the action.
    pub channel_id: ChannelId,

    /// Snapshot taken when the event was published.
    pub overview: BulkActionOverview,

    pub timestamp: DateTime<Utc>,
}

impl BulkActionEvent {
    /// Progress of a running action.
    pub fn overview(channel_id: impl Into<ChannelId>, overview: BulkActionOverview) -> Self {
        Self::with_type(MSG_TYPE_BULK_ACTION_OVERVIEW, channel_id, overview)
    }

    /// Final snapshot of an action that just became terminal.
    pub fn finished(channel_id: impl Into<ChannelId>, overview: BulkActionOverview) -> Self {
        Self::with_type(MSG_TYPE_BULK_ACTION_FINISHED, channel_id, overview)
    }

    fn with_type(
        event_type: &str,
        channel_id: impl Into<ChannelId>,
        overview: BulkActionOverview,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            channel_id: channel_id.into(),
            overview,
            timestamp: Utc::now(),
        }
    }

    /// WebSocket frame for this event: `{"type": ..., "data": overview}`.
    pub fn to_ws_message(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.event_type,
            "data": self.overview,
        })
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out bus for [`BulkActionEvent`]s.
///
/// Slow subscribers that fall more than `capacity` events behind observe
/// `RecvError::Lagged` and miss the overwritten events. Overviews are full
/// snapshots, so a later event supersedes anything missed.
pub struct EventBus {
    sender: broadcast::Sender<BulkActionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: BulkActionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BulkActionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
