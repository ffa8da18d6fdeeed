//! Forwards [`BulkActionEvent`]s from the event bus to the WebSocket
//! connection that owns the action's channel.
//!
//! Events for channels without a live connection (HTTP-created actions,
//! clients that already left) are dropped.

use std::sync::Arc;

use kvdesk_events::BulkActionEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::ws::WsManager;

pub struct BulkEventForwarder {
    ws_manager: Arc<WsManager>,
}

impl BulkEventForwarder {
    pub fn new(ws_manager: Arc<WsManager>) -> Self {
        Self { ws_manager }
    }

    /// Forward events until the bus closes or `cancel` fires.
    pub async fn run(
        self,
        mut receiver: broadcast::Receiver<BulkActionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = receiver.recv() => received,
            };
            match received {
                Ok(event) => self.forward(&event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Bulk event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, bulk event forwarder shutting down");
                    break;
                }
            }
        }
    }

    async fn forward(&self, event: &BulkActionEvent) {
        let delivered = self
            .ws_manager
            .send_json(&event.channel_id, &event.to_ws_message())
            .await;
        if !delivered {
            tracing::trace!(
                channel_id = %event.channel_id,
                event_type = %event.event_type,
                "No live connection for bulk action event",
            );
        }
    }
}
