use std::time::Duration;

pub use sea_orm;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};

pub mod entities;

/// Opens the connection pool for `database_url` (postgres or sqlite).
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opts = ConnectOptions::new(database_url);
    opts.connect_timeout(Duration::from_secs(10));
    // Each pooled connection to an in-memory sqlite database sees its own
    // empty schema.
    if database_url.starts_with("sqlite::memory:") {
        opts.max_connections(1).min_connections(1);
    }
    Database::connect(opts).await
}
