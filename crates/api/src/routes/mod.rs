pub mod bulk_actions;
pub mod health;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                                        WebSocket (channel id = connection id)
///
/// /bulk-actions                              create (POST)
/// /bulk-actions/{id}                         get, delete
/// /bulk-actions/{id}/abort                   abort (POST)
/// /bulk-actions/{id}/report/download         stream report (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/bulk-actions", bulk_actions::router())
}
