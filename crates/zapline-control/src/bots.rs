use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use zapline_db::entities::{bots, messages};
use zapline_instance::BotId;

use crate::api_error::{ApiError, ApiResult};
use crate::bot_store::NewBot;
use crate::state::AppState;

const DEFAULT_MESSAGE_LIMIT: u64 = 50;
const MAX_MESSAGE_LIMIT: u64 = 500;

#[derive(Debug, Serialize)]
pub struct BotView {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub phone_number: Option<String>,
    pub status: String,
    pub qr_code: Option<String>,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

impl From<bots::Model> for BotView {
    fn from(m: bots::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            description: m.description,
            phone_number: m.phone_number,
            status: m.status,
            qr_code: m.qr_code,
            webhook_url: m.webhook_url,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: i32,
    pub bot_id: i32,
    pub contact_number: String,
    pub contact_name: Option<String>,
    pub message_type: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub direction: String,
    pub status: String,
    pub timestamp: DateTime<FixedOffset>,
}

impl From<messages::Model> for MessageView {
    fn from(m: messages::Model) -> Self {
        Self {
            id: m.id,
            bot_id: m.bot_id,
            contact_number: m.contact_number,
            contact_name: m.contact_name,
            message_type: m.message_type,
            content: m.content,
            media_url: m.media_url,
            direction: m.direction,
            status: m.status,
            timestamp: m.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub phone_number: Option<String>,
    pub webhook_url: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct DeleteBotResponse {
    pub deleted: bool,
    pub stopped: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bots", get(list_bots).post(create_bot))
        .route("/bots/:id", get(get_bot).delete(delete_bot))
        .route("/bots/:id/messages", get(list_messages))
}

async fn list_bots(State(state): State<AppState>) -> ApiResult<Json<Vec<BotView>>> {
    let rows = state.store.list_bots().await.map_err(ApiError::internal)?;
    Ok(Json(rows.into_iter().map(BotView::from).collect()))
}

async fn create_bot(
    State(state): State<AppState>,
    Json(req): Json<CreateBotRequest>,
) -> ApiResult<(StatusCode, Json<BotView>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::invalid_request("name is required"));
    }

    let new = NewBot {
        name,
        description: non_blank(req.description),
        phone_number: non_blank(req.phone_number),
        webhook_url: non_blank(req.webhook_url),
    };
    match state.store.create_bot(new).await {
        Ok(m) => {
            tracing::info!(bot_id = m.id, name = %m.name, "bot created");
            Ok((StatusCode::CREATED, Json(BotView::from(m))))
        }
        Err(err)
            if matches!(
                err.sql_err(),
                Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
            ) =>
        {
            Err(ApiError::conflict("phone number already registered"))
        }
        Err(err) => Err(ApiError::internal(err)),
    }
}

pub(crate) async fn load_bot(state: &AppState, id: i32) -> ApiResult<bots::Model> {
    state
        .store
        .find_bot(BotId(id))
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("bot {id} not found")))
}

async fn get_bot(State(state): State<AppState>, Path(id): Path<i32>) -> ApiResult<Json<BotView>> {
    Ok(Json(load_bot(&state, id).await?.into()))
}

async fn delete_bot(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<Json<DeleteBotResponse>> {
    load_bot(&state, id).await?;
    let bot_id = BotId(id);

    // Stops any live worker and wipes its session data.
    let stopped = state.supervisor.purge_instance_data(bot_id).await?;
    let deleted = state
        .store
        .delete_bot(bot_id)
        .await
        .map_err(ApiError::internal)?;

    tracing::info!(%bot_id, stopped = stopped.is_some(), "bot deleted");
    Ok(Json(DeleteBotResponse {
        deleted,
        stopped: stopped.is_some(),
    }))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(q): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<MessageView>>> {
    load_bot(&state, id).await?;
    let limit = q
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);
    let rows = state
        .store
        .list_messages(BotId(id), limit)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(rows.into_iter().map(MessageView::from).collect()))
}
