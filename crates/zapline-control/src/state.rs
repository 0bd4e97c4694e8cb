use std::sync::Arc;

use zapline_supervisor::Supervisor;

use crate::bot_store::SeaBotStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SeaBotStore>,
    pub supervisor: Supervisor,
}
