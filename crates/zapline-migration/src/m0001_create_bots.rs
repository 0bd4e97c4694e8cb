use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Bots::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Bots::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Bots::Name).string_len(100).not_null())
                    .col(ColumnDef::new(Bots::Description).text().null())
                    .col(ColumnDef::new(Bots::PhoneNumber).string_len(20).null())
                    .col(
                        ColumnDef::new(Bots::Status)
                            .string_len(20)
                            .not_null()
                            .default("inactive"),
                    )
                    .col(ColumnDef::new(Bots::QrCode).text().null())
                    .col(ColumnDef::new(Bots::WebhookUrl).string_len(255).null())
                    .col(
                        ColumnDef::new(Bots::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Bots::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .index(
                        Index::create()
                            .name("idx_bots_phone_number_unique")
                            .table(Bots::Table)
                            .col(Bots::PhoneNumber)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Bots::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Bots {
    Table,
    Id,
    Name,
    Description,
    PhoneNumber,
    Status,
    QrCode,
    WebhookUrl,
    CreatedAt,
    UpdatedAt,
}
