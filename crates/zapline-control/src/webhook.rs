use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use serde::{Deserialize, Serialize};
use zapline_instance::BotId;

use crate::api_error::{ApiError, ApiResult};
use crate::bot_store::{Direction, NewMessage};
use crate::bots::load_bot;
use crate::state::AppState;

/// Event posted by a worker. Workers send the flat form; the nested
/// `message` form is accepted from older integrations.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub from: Option<String>,
    pub body: Option<String>,
    pub message_type: Option<String>,
    pub notify_name: Option<String>,
    pub is_group: Option<bool>,
    pub message: Option<NestedMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedMessage {
    pub from: Option<String>,
    pub body: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub media_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i32>,
}

/// Incoming message extracted from a webhook event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Inbound {
    pub contact_number: String,
    pub contact_name: Option<String>,
    pub message_type: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
}

/// `Ok(None)` for events that are acknowledged but not stored.
pub(crate) fn classify(event: WebhookEvent) -> Result<Option<Inbound>, &'static str> {
    if let Some(nested) = event.message {
        let contact_number = nested.from.filter(|f| !f.trim().is_empty()).ok_or("message.from is required")?;
        return Ok(Some(Inbound {
            contact_number,
            contact_name: None,
            message_type: nested.kind.unwrap_or_else(|| "text".to_string()),
            content: nested.body,
            media_url: nested.media_url,
        }));
    }

    match event.kind.as_deref() {
        Some("message_received") => {
            let contact_number = event.from.filter(|f| !f.trim().is_empty()).ok_or("from is required")?;
            let message_type = match event.message_type.as_deref() {
                None | Some("chat") => "text".to_string(),
                Some(other) => other.to_string(),
            };
            Ok(Some(Inbound {
                contact_number,
                contact_name: event.notify_name,
                message_type,
                content: event.body,
                media_url: None,
            }))
        }
        _ => Ok(None),
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook/:id", post(receive))
}

async fn receive(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(event): Json<WebhookEvent>,
) -> ApiResult<Json<WebhookAck>> {
    load_bot(&state, id).await?;
    let bot_id = BotId(id);
    let kind = event.kind.clone();

    let Some(inbound) = classify(event).map_err(ApiError::invalid_request)? else {
        tracing::debug!(%bot_id, kind = ?kind, "webhook event acknowledged");
        return Ok(Json(WebhookAck {
            status: "ignored",
            message_id: None,
        }));
    };

    let stored = state
        .store
        .insert_message(NewMessage {
            bot_id,
            contact_number: inbound.contact_number,
            contact_name: inbound.contact_name,
            message_type: inbound.message_type,
            content: inbound.content,
            media_url: inbound.media_url,
            direction: Direction::Incoming,
            status: "received".to_string(),
        })
        .await
        .map_err(ApiError::internal)?;

    // Flow execution consumes this event; nothing else happens here.
    tracing::info!(%bot_id, message_id = stored.id, "incoming message stored");
    Ok(Json(WebhookAck {
        status: "received",
        message_id: Some(stored.id),
    }))
}
