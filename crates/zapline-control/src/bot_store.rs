use std::sync::Arc;

use anyhow::Context;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait, sea_query::Expr,
};
use zapline_db::entities::{bots, messages};
use zapline_instance::BotId;
use zapline_supervisor::{BotRecord, BotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewBot {
    pub name: String,
    pub description: Option<String>,
    pub phone_number: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub bot_id: BotId,
    pub contact_number: String,
    pub contact_name: Option<String>,
    pub message_type: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub direction: Direction,
    pub status: String,
}

/// sea-orm backed bot and message storage.
#[derive(Clone)]
pub struct SeaBotStore {
    db: Arc<DatabaseConnection>,
}

fn to_record(m: bots::Model) -> BotRecord {
    BotRecord {
        id: BotId(m.id),
        name: m.name,
        phone_number: m.phone_number,
        status: m.status,
        qr_code: m.qr_code,
        webhook_url: m.webhook_url,
    }
}

impl SeaBotStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Fails with the raw `DbErr` so callers can tell a duplicate phone
    /// number apart from other failures.
    pub async fn create_bot(&self, new: NewBot) -> Result<bots::Model, DbErr> {
        let now = chrono::Utc::now().fixed_offset();
        bots::ActiveModel {
            name: Set(new.name),
            description: Set(new.description),
            phone_number: Set(new.phone_number),
            status: Set("inactive".to_string()),
            qr_code: Set(None),
            webhook_url: Set(new.webhook_url),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
    }

    pub async fn list_bots(&self) -> anyhow::Result<Vec<bots::Model>> {
        bots::Entity::find()
            .order_by_asc(bots::Column::Id)
            .all(&*self.db)
            .await
            .context("list bots")
    }

    pub async fn find_bot(&self, bot_id: BotId) -> anyhow::Result<Option<bots::Model>> {
        bots::Entity::find_by_id(bot_id.0)
            .one(&*self.db)
            .await
            .with_context(|| format!("load bot {bot_id}"))
    }

    /// Deletes the bot and its messages. Returns false if it did not exist.
    pub async fn delete_bot(&self, bot_id: BotId) -> anyhow::Result<bool> {
        let txn = self.db.begin().await.context("begin delete bot")?;
        messages::Entity::delete_many()
            .filter(messages::Column::BotId.eq(bot_id.0))
            .exec(&txn)
            .await
            .with_context(|| format!("delete messages of bot {bot_id}"))?;
        let res = bots::Entity::delete_by_id(bot_id.0)
            .exec(&txn)
            .await
            .with_context(|| format!("delete bot {bot_id}"))?;
        txn.commit().await.context("commit delete bot")?;
        Ok(res.rows_affected > 0)
    }

    pub async fn insert_message(&self, new: NewMessage) -> anyhow::Result<messages::Model> {
        messages::ActiveModel {
            bot_id: Set(new.bot_id.0),
            contact_number: Set(new.contact_number),
            contact_name: Set(new.contact_name),
            message_type: Set(new.message_type),
            content: Set(new.content),
            media_url: Set(new.media_url),
            direction: Set(new.direction.as_str().to_string()),
            status: Set(new.status),
            timestamp: Set(chrono::Utc::now().fixed_offset()),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .with_context(|| format!("store message for bot {}", new.bot_id))
    }

    /// Newest first.
    pub async fn list_messages(
        &self,
        bot_id: BotId,
        limit: u64,
    ) -> anyhow::Result<Vec<messages::Model>> {
        messages::Entity::find()
            .filter(messages::Column::BotId.eq(bot_id.0))
            .order_by_desc(messages::Column::Timestamp)
            .order_by_desc(messages::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await
            .with_context(|| format!("list messages of bot {bot_id}"))
    }

    async fn update_column(
        &self,
        bot_id: BotId,
        column: bots::Column,
        value: sea_orm::Value,
    ) -> anyhow::Result<()> {
        bots::Entity::update_many()
            .col_expr(column, Expr::value(value))
            .col_expr(
                bots::Column::UpdatedAt,
                Expr::value(chrono::Utc::now().fixed_offset()),
            )
            .filter(bots::Column::Id.eq(bot_id.0))
            .exec(&*self.db)
            .await
            .with_context(|| format!("update bot {bot_id}"))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BotStore for SeaBotStore {
    async fn load_bot(&self, bot_id: BotId) -> anyhow::Result<Option<BotRecord>> {
        Ok(self.find_bot(bot_id).await?.map(to_record))
    }

    async fn write_status(&self, bot_id: BotId, status: &str) -> anyhow::Result<()> {
        self.update_column(bot_id, bots::Column::Status, status.into())
            .await
    }

    async fn write_qr_code(&self, bot_id: BotId, qr_code: Option<&str>) -> anyhow::Result<()> {
        self.update_column(
            bot_id,
            bots::Column::QrCode,
            qr_code.map(str::to_string).into(),
        )
        .await
    }
}
