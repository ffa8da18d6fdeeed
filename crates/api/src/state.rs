use std::sync::Arc;

use kvdesk_bulk::BulkActionRegistry;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: every field is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// WebSocket connections, keyed by channel id.
    pub ws_manager: Arc<WsManager>,
    /// Every bulk action known to this process.
    pub bulk_actions: Arc<BulkActionRegistry>,
}
