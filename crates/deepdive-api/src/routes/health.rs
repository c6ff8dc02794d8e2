use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn health_router() -> Router<AppState> {
    Router::new().route("/live", get(live))
}

async fn live() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
