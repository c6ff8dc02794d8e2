mod health;
mod session;

use axum::Router;
use health::health_router;
use session::session_router;

use crate::state::AppState;

pub use session::CALLER_HEADER;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health_router())
        .nest("/api", session_router())
        .with_state(state)
}
