use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use zapline_instance::{BotId, InstanceSnapshot, InstanceStatus};
use zapline_supervisor::{BotStore, StopPath};

use crate::api_error::{ApiError, ApiResult};
use crate::bot_store::{Direction, NewMessage};
use crate::bots::{MessageView, load_bot};
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 1000;

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub message: String,
    pub instance: InstanceSnapshot,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub message: String,
    pub stop_path: StopPath,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub bot_id: i32,
    pub status: String,
    pub qr_code: Option<String>,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub cursor: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMediaRequest {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub message: String,
    pub message_data: Option<MessageView>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bots/:id/start", post(start))
        .route("/bots/:id/stop", post(stop))
        .route("/bots/:id/status", get(status))
        .route("/bots/:id/logs", get(logs))
        .route("/bots/:id/send-message", post(send_message))
        .route("/bots/:id/send-media", post(send_media))
}

async fn start(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<Json<StartResponse>> {
    let instance = state.supervisor.start_bot(BotId(id)).await?;
    Ok(Json(StartResponse {
        message: format!("bot {id} started"),
        instance,
    }))
}

async fn stop(State(state): State<AppState>, Path(id): Path<i32>) -> ApiResult<Json<StopResponse>> {
    load_bot(&state, id).await?;
    let bot_id = BotId(id);
    let stop_path = state.supervisor.stop_instance(bot_id).await?;

    let label = InstanceStatus::Stopped.persisted_label();
    if let Err(err) = state.store.write_status(bot_id, label).await {
        tracing::warn!(%bot_id, error = %err, "failed to mark bot inactive");
    }
    if let Err(err) = state.store.write_qr_code(bot_id, None).await {
        tracing::warn!(%bot_id, error = %err, "failed to clear bot qr code");
    }

    Ok(Json(StopResponse {
        message: format!("bot {id} stopped"),
        stop_path,
    }))
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<Json<StatusResponse>> {
    let bot = load_bot(&state, id).await?;
    let bot_id = BotId(id);
    let sup = &state.supervisor;

    let Some(live) = sup.get_instance_status(bot_id).await else {
        return Ok(Json(StatusResponse {
            bot_id: id,
            status: bot.status,
            qr_code: bot.qr_code,
            running: false,
            port: None,
        }));
    };

    let snapshot = sup.snapshot(bot_id).await;
    let qr_code = if live.is_terminal() || live == InstanceStatus::Active {
        None
    } else {
        match sup.get_instance_qr(bot_id).await {
            Some(qr) => Some(qr),
            None => snapshot.as_ref().and_then(|s| s.qr_code.clone()),
        }
    };

    Ok(Json(StatusResponse {
        bot_id: id,
        status: live.persisted_label().to_string(),
        qr_code,
        running: true,
        port: snapshot.map(|s| s.port),
    }))
}

async fn logs(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let (lines, next_cursor) = state
        .supervisor
        .tail_logs(BotId(id), q.cursor.unwrap_or(0), limit)
        .await
        .ok_or_else(|| ApiError::not_found(format!("bot {id} has no running instance")))?;
    Ok(Json(LogsResponse { lines, next_cursor }))
}

async fn require_active(state: &AppState, bot_id: BotId) -> ApiResult<()> {
    match state.supervisor.get_instance_status(bot_id).await {
        Some(InstanceStatus::Active) => Ok(()),
        _ => Err(ApiError::bot_not_active()),
    }
}

async fn record_outgoing(state: &AppState, new: NewMessage) -> Option<MessageView> {
    let bot_id = new.bot_id;
    match state.store.insert_message(new).await {
        Ok(m) => Some(m.into()),
        Err(err) => {
            tracing::warn!(%bot_id, error = %format!("{err:#}"), "message sent but not stored");
            None
        }
    }
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<SendResponse>> {
    let number = req.number.trim();
    let text = req.message.trim();
    if number.is_empty() || text.is_empty() {
        return Err(ApiError::invalid_request("number and message are required"));
    }

    load_bot(&state, id).await?;
    let bot_id = BotId(id);
    require_active(&state, bot_id).await?;

    state.supervisor.send_message(bot_id, number, text).await?;
    let message_data = record_outgoing(
        &state,
        NewMessage {
            bot_id,
            contact_number: number.to_string(),
            contact_name: None,
            message_type: "text".to_string(),
            content: Some(text.to_string()),
            media_url: None,
            direction: Direction::Outgoing,
            status: "sent".to_string(),
        },
    )
    .await;

    Ok(Json(SendResponse {
        message: "message sent".to_string(),
        message_data,
    }))
}

async fn send_media(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(req): Json<SendMediaRequest>,
) -> ApiResult<Json<SendResponse>> {
    let number = req.number.trim();
    let file_url = req.file_url.trim();
    if number.is_empty() || file_url.is_empty() {
        return Err(ApiError::invalid_request("number and file_url are required"));
    }
    let caption = req.caption.as_deref().map(str::trim).unwrap_or("");

    load_bot(&state, id).await?;
    let bot_id = BotId(id);
    require_active(&state, bot_id).await?;

    state
        .supervisor
        .send_media(bot_id, number, file_url, caption)
        .await?;
    let message_data = record_outgoing(
        &state,
        NewMessage {
            bot_id,
            contact_number: number.to_string(),
            contact_name: None,
            message_type: "media".to_string(),
            content: (!caption.is_empty()).then(|| caption.to_string()),
            media_url: Some(file_url.to_string()),
            direction: Direction::Outgoing,
            status: "sent".to_string(),
        },
    )
    .await;

    Ok(Json(SendResponse {
        message: "media sent".to_string(),
        message_data,
    }))
}
