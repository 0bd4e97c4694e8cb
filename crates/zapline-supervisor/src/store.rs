use zapline_instance::BotId;

/// The slice of a persisted bot that the supervisor reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotRecord {
    pub id: BotId,
    pub name: String,
    pub phone_number: Option<String>,
    pub status: String,
    pub qr_code: Option<String>,
    pub webhook_url: Option<String>,
}

/// Persistence contract consumed by the supervisor. `write_status` and
/// `write_qr_code` are only called from the reconciler and from explicit user
/// actions (stop/delete).
#[async_trait::async_trait]
pub trait BotStore: Send + Sync + 'static {
    async fn load_bot(&self, bot_id: BotId) -> anyhow::Result<Option<BotRecord>>;

    async fn write_status(&self, bot_id: BotId, status: &str) -> anyhow::Result<()>;

    async fn write_qr_code(&self, bot_id: BotId, qr_code: Option<&str>) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Write {
        Status(BotId, String),
        Qr(BotId, Option<String>),
    }

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        bots: Mutex<HashMap<BotId, BotRecord>>,
        writes: Mutex<Vec<Write>>,
    }

    impl MemoryStore {
        pub(crate) async fn insert(&self, id: BotId, webhook_url: Option<&str>) {
            self.bots.lock().await.insert(
                id,
                BotRecord {
                    id,
                    name: format!("bot-{id}"),
                    phone_number: None,
                    status: "inactive".to_string(),
                    qr_code: None,
                    webhook_url: webhook_url.map(str::to_string),
                },
            );
        }

        pub(crate) async fn get(&self, id: BotId) -> Option<BotRecord> {
            self.bots.lock().await.get(&id).cloned()
        }

        pub(crate) async fn writes(&self) -> Vec<Write> {
            self.writes.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl BotStore for MemoryStore {
        async fn load_bot(&self, bot_id: BotId) -> anyhow::Result<Option<BotRecord>> {
            Ok(self.get(bot_id).await)
        }

        async fn write_status(&self, bot_id: BotId, status: &str) -> anyhow::Result<()> {
            if let Some(b) = self.bots.lock().await.get_mut(&bot_id) {
                b.status = status.to_string();
            }
            self.writes
                .lock()
                .await
                .push(Write::Status(bot_id, status.to_string()));
            Ok(())
        }

        async fn write_qr_code(&self, bot_id: BotId, qr_code: Option<&str>) -> anyhow::Result<()> {
            if let Some(b) = self.bots.lock().await.get_mut(&bot_id) {
                b.qr_code = qr_code.map(str::to_string);
            }
            self.writes
                .lock()
                .await
                .push(Write::Qr(bot_id, qr_code.map(str::to_string)));
            Ok(())
        }
    }
}
