//! Route definitions for the `/bulk-actions` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::bulk_actions;
use crate::state::AppState;

/// Routes mounted at `/bulk-actions`.
///
/// ```text
/// POST   /                        -> create_bulk_action
/// GET    /{id}                    -> get_bulk_action
/// DELETE /{id}                    -> delete_bulk_action
/// POST   /{id}/abort              -> abort_bulk_action
/// GET    /{id}/report/download    -> download_report
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(bulk_actions::create_bulk_action))
        .route(
            "/{id}",
            get(bulk_actions::get_bulk_action).delete(bulk_actions::delete_bulk_action),
        )
        .route("/{id}/abort", post(bulk_actions::abort_bulk_action))
        .route(
            "/{id}/report/download",
            get(bulk_actions::download_report),
        )
}
