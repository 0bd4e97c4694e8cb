use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Messages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Messages::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Messages::BotId).integer().not_null())
                    .col(ColumnDef::new(Messages::ContactNumber).string_len(20).not_null())
                    .col(ColumnDef::new(Messages::ContactName).string_len(100).null())
                    .col(
                        ColumnDef::new(Messages::MessageType)
                            .string_len(20)
                            .not_null()
                            .default("text"),
                    )
                    .col(ColumnDef::new(Messages::Content).text().null())
                    .col(ColumnDef::new(Messages::MediaUrl).string_len(255).null())
                    .col(ColumnDef::new(Messages::Direction).string_len(10).not_null())
                    .col(
                        ColumnDef::new(Messages::Status)
                            .string_len(20)
                            .not_null()
                            .default("sent"),
                    )
                    .col(
                        ColumnDef::new(Messages::Timestamp)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_messages_bot")
                            .from(Messages::Table, Messages::BotId)
                            .to(Bots::Table, Bots::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_messages_bot_id_timestamp")
                    .table(Messages::Table)
                    .col(Messages::BotId)
                    .col(Messages::Timestamp)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Messages::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Messages {
    Table,
    Id,
    BotId,
    ContactNumber,
    ContactName,
    MessageType,
    Content,
    MediaUrl,
    Direction,
    Status,
    Timestamp,
}

#[derive(DeriveIden)]
enum Bots {
    Table,
    Id,
}
