use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    routing::{get, post},
};
use deepdive_core::{AdvanceOutcome, Citation, SessionView};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the authenticated caller's user id.
pub const CALLER_HEADER: &str = "x-user-id";

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub topic: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct AdvanceResponse {
    pub session_id: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdvanceResponse {
    fn new(session_id: String, outcome: AdvanceOutcome) -> Self {
        let (label, reason, error) = match outcome {
            AdvanceOutcome::Continue => ("continue", None, None),
            AdvanceOutcome::Completed => ("completed", None, None),
            AdvanceOutcome::Failed { message } => ("failed", None, Some(message)),
            AdvanceOutcome::Skipped(reason) => ("skipped", Some(reason.as_str()), None),
        };
        Self {
            session_id,
            outcome: label,
            reason,
            error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CitationsResponse {
    pub session_id: String,
    pub citations: Vec<Citation>,
}

pub fn session_router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/advance", post(advance_session))
        .route("/sessions/:id/citations", get(list_citations))
        .route("/sessions/:id/cancel", post(cancel_session))
}

#[instrument(skip_all, fields(user_id = %caller.0))]
async fn create_session(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let session = state
        .service()
        .create(&payload.topic, &caller.0, payload.model.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
        }),
    ))
}

#[instrument(skip_all, fields(session_id = %session_id))]
async fn advance_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
) -> Result<Json<AdvanceResponse>, AppError> {
    let outcome = state.service().trigger(&session_id, &caller.0).await?;
    Ok(Json(AdvanceResponse::new(session_id, outcome)))
}

async fn get_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.service().status(&session_id, &caller.0).await?))
}

async fn list_citations(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
) -> Result<Json<CitationsResponse>, AppError> {
    let citations = state.service().citations(&session_id, &caller.0).await?;
    Ok(Json(CitationsResponse {
        session_id,
        citations,
    }))
}

#[instrument(skip_all, fields(session_id = %session_id))]
async fn cancel_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.service().cancel(&session_id, &caller.0).await?))
}

/// Caller identity taken from [`CALLER_HEADER`]. Authentication itself is
/// performed upstream.
pub struct Caller(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Caller(value.to_string()))
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing x-user-id header"))
    }
}
