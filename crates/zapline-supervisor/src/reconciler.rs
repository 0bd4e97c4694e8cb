use std::sync::Arc;

use zapline_instance::{BotId, InstanceStatus};

use crate::store::BotStore;

/// Live state sampled from one instance during a monitor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub status: InstanceStatus,
    pub qr_code: Option<String>,
}

/// What a monitor loop last wrote into the bot record. `None` means nothing
/// has been written yet by this loop.
#[derive(Debug, Default)]
pub struct Mirror {
    status: Option<InstanceStatus>,
    qr_code: Option<Option<String>>,
}

/// Copies live instance state into persisted bot records, writing only the
/// fields that changed since the previous tick.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BotStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BotStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn BotStore> {
        &self.store
    }

    pub async fn sync(&self, bot_id: BotId, observed: &Observation, mirror: &mut Mirror) {
        if mirror.status != Some(observed.status) {
            let label = observed.status.persisted_label();
            match self.store.write_status(bot_id, label).await {
                Ok(()) => {
                    tracing::debug!(%bot_id, status = label, "reconciled bot status");
                    mirror.status = Some(observed.status);
                }
                Err(err) => {
                    tracing::warn!(%bot_id, error = %err, "failed to persist bot status");
                }
            }
        }

        // A paired or dead session has no QR worth showing.
        let settled = observed.status.is_terminal() || observed.status == InstanceStatus::Active;
        let wanted_qr = if settled {
            Some(None)
        } else {
            observed.qr_code.clone().map(Some)
        };
        let Some(wanted_qr) = wanted_qr else {
            return;
        };
        if mirror.qr_code.as_ref() == Some(&wanted_qr) {
            return;
        }
        match self.store.write_qr_code(bot_id, wanted_qr.as_deref()).await {
            Ok(()) => {
                tracing::debug!(%bot_id, cleared = wanted_qr.is_none(), "reconciled bot qr code");
                mirror.qr_code = Some(wanted_qr);
            }
            Err(err) => {
                tracing::warn!(%bot_id, error = %err, "failed to persist bot qr code");
            }
        }
    }
}
