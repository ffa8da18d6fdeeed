//! Handlers for the `/bulk-actions` resource.
//!
//! Every action belongs to a channel. Clients connected over the WebSocket
//! pass their connection's channel id in `x-channel-id` so progress events
//! reach them and closing the socket aborts the action. Without the header
//! the action gets a private `http:<uuid>` channel and is only observable
//! by polling.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use kvdesk_core::bulk_action::CreateBulkAction;
use kvdesk_core::report::REPORT_CONTENT_TYPE;
use kvdesk_core::types::ChannelId;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Header carrying the caller's channel id.
pub const CHANNEL_HEADER: &str = "x-channel-id";

fn channel_from_headers(headers: &HeaderMap) -> AppResult<ChannelId> {
    match headers.get(CHANNEL_HEADER) {
        None => Ok(format!("http:{}", uuid::Uuid::new_v4())),
        Some(value) => {
            let channel = value
                .to_str()
                .map_err(|_| AppError::BadRequest(format!("{CHANNEL_HEADER} must be ASCII")))?
                .trim();
            if channel.is_empty() {
                return Err(AppError::BadRequest(format!(
                    "{CHANNEL_HEADER} must not be empty"
                )));
            }
            Ok(channel.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// POST /api/v1/bulk-actions
pub async fn create_bulk_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateBulkAction>,
) -> AppResult<impl IntoResponse> {
    let channel_id = channel_from_headers(&headers)?;
    let overview = state.bulk_actions.create(&channel_id, input).await?;

    tracing::info!(
        action_id = %overview.id,
        channel_id = %channel_id,
        database_id = %overview.database_id,
        action_type = overview.action_type.as_str(),
        "Bulk action created",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: overview })))
}

/// GET /api/v1/bulk-actions/{id}
pub async fn get_bulk_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let overview = state.bulk_actions.get(&id).await?;
    Ok(Json(DataResponse { data: overview }))
}

/// POST /api/v1/bulk-actions/{id}/abort
///
/// Returns the overview as of the abort request; the action reaches
/// `aborted` once its in-flight batch has been applied.
pub async fn abort_bulk_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let overview = state.bulk_actions.abort(&id).await?;
    tracing::info!(action_id = %id, "Bulk action abort requested");
    Ok(Json(DataResponse { data: overview }))
}

/// DELETE /api/v1/bulk-actions/{id}
pub async fn delete_bulk_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let overview = state.bulk_actions.remove(&id).await?;
    Ok(Json(DataResponse { data: overview }))
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// GET /api/v1/bulk-actions/{id}/report/download
///
/// Streams the report as it is produced. The body ends after the summary
/// line, i.e. when the action is terminal.
pub async fn download_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let download = state.bulk_actions.stream_report(&id).await?;
    tracing::debug!(action_id = %id, filename = %download.filename, "Streaming bulk action report");

    let stream = ReceiverStream::new(download.chunks).map(Ok::<_, Infallible>);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, REPORT_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download.filename),
            ),
        ],
        Body::from_stream(stream),
    ))
}
