pub mod api_error;
pub mod bot_store;
pub mod bots;
pub mod instances;
pub mod state;
pub mod webhook;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    instances: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instances: state.supervisor.list_instances().await.len(),
    })
}

/// Full HTTP surface, mounted under `/api`.
pub fn app(state: AppState) -> Router {
    let whatsapp = instances::router().merge(webhook::router());
    let api = Router::new()
        .route("/healthz", get(healthz))
        .merge(bots::router())
        .nest("/whatsapp", whatsapp);

    Router::new().nest("/api", api).with_state(state)
}
