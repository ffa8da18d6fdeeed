//! JSON framing of the WebSocket request/reply protocol.
//!
//! ```text
//! -> {"type":"create","data":{...CreateBulkAction}}
//! -> {"type":"get","id":"<action id>"}
//! -> {"type":"abort","id":"<action id>"}
//! <- {"type":"bulk_action_overview","data":{...}}
//! <- {"type":"error","code":"NOT_FOUND","error":"..."}
//! ```
//!
//! A `requestId` on a request is echoed on its reply. Progress events
//! pushed by the engine use the same `bulk_action_overview` frame (and
//! `bulk_action_finished` for the terminal one) without a `requestId`.

use kvdesk_bulk::BulkActionRegistry;
use kvdesk_core::bulk_action::{BulkActionOverview, CreateBulkAction};
use kvdesk_core::bulk_events::{
    MSG_TYPE_ABORT, MSG_TYPE_BULK_ACTION_OVERVIEW, MSG_TYPE_CONNECTED, MSG_TYPE_CREATE,
    MSG_TYPE_ERROR, MSG_TYPE_GET,
};
use kvdesk_core::types::ActionId;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    id: Option<ActionId>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(rename = "requestId", default)]
    request_id: Option<Value>,
}

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum WsRequest {
    Create(CreateBulkAction),
    Get(ActionId),
    Abort(ActionId),
}

impl WsRequest {
    fn from_envelope(envelope: Envelope) -> AppResult<Self> {
        match envelope.msg_type.as_str() {
            MSG_TYPE_CREATE => {
                let data = envelope.data.ok_or_else(|| {
                    AppError::BadRequest("create requires a data object".into())
                })?;
                let params = serde_json::from_value(data)
                    .map_err(|e| AppError::BadRequest(format!("invalid create payload: {e}")))?;
                Ok(WsRequest::Create(params))
            }
            MSG_TYPE_GET => Ok(WsRequest::Get(require_id(envelope.id, MSG_TYPE_GET)?)),
            MSG_TYPE_ABORT => Ok(WsRequest::Abort(require_id(envelope.id, MSG_TYPE_ABORT)?)),
            other => Err(AppError::BadRequest(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

fn require_id(id: Option<ActionId>, msg_type: &str) -> AppResult<ActionId> {
    id.filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("{msg_type} requires an id")))
}

/// Handle one text frame from `channel_id` and build the reply frame.
pub async fn dispatch(registry: &BulkActionRegistry, channel_id: &str, text: &str) -> Value {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            return error_frame(&AppError::BadRequest(format!("malformed message: {e}")), None)
        }
    };
    let request_id = envelope.request_id.clone();

    let result = match WsRequest::from_envelope(envelope) {
        Ok(request) => execute(registry, channel_id, request).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(overview) => overview_frame(&overview, request_id),
        Err(e) => {
            tracing::debug!(channel_id, error = %e, "WebSocket request failed");
            error_frame(&e, request_id)
        }
    }
}

async fn execute(
    registry: &BulkActionRegistry,
    channel_id: &str,
    request: WsRequest,
) -> AppResult<BulkActionOverview> {
    let overview = match request {
        WsRequest::Create(params) => {
            let overview = registry.create(channel_id, params).await?;
            tracing::info!(
                action_id = %overview.id,
                channel_id,
                database_id = %overview.database_id,
                "Bulk action created over WebSocket",
            );
            overview
        }
        WsRequest::Get(id) => registry.get(&id).await?,
        WsRequest::Abort(id) => registry.abort(&id).await?,
    };
    Ok(overview)
}

/// First frame of every connection.
pub fn connected_frame(channel_id: &str) -> Value {
    json!({ "type": MSG_TYPE_CONNECTED, "channel_id": channel_id })
}

pub fn overview_frame(overview: &BulkActionOverview, request_id: Option<Value>) -> Value {
    with_request_id(
        json!({ "type": MSG_TYPE_BULK_ACTION_OVERVIEW, "data": overview }),
        request_id,
    )
}

pub fn error_frame(err: &AppError, request_id: Option<Value>) -> Value {
    let (_, code, message) = err.parts();
    with_request_id(
        json!({ "type": MSG_TYPE_ERROR, "code": code, "error": message }),
        request_id,
    )
}

fn with_request_id(mut frame: Value, request_id: Option<Value>) -> Value {
    if let (Some(id), Some(obj)) = (request_id, frame.as_object_mut()) {
        obj.insert("requestId".into(), id);
    }
    frame
}
