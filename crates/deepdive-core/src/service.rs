//! Caller-facing operations: create, trigger, status, cancel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::driver::{AdvanceOutcome, StepDriver};
use crate::error::DeepDiveError;
use crate::progress::ProgressEntry;
use crate::scheduler::DynScheduler;
use crate::session::{
    Citation, KnowledgeEntry, NewSession, Phase, ResearchSession, SessionStatus, SubTopic,
};

/// Read model of a session for display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub topic: String,
    pub model: String,
    pub status: SessionStatus,
    pub phase: Phase,
    pub plan: Vec<SubTopic>,
    pub plan_rationale: Option<String>,
    pub sub_topic_cursor: usize,
    pub research_round: u32,
    pub knowledge: Vec<KnowledgeEntry>,
    pub progress: Vec<ProgressEntry>,
    pub final_report: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ResearchSession> for SessionView {
    fn from(session: &ResearchSession) -> Self {
        Self {
            id: session.id.clone(),
            topic: session.topic.clone(),
            model: session.model.clone(),
            status: session.display_status(),
            phase: session.phase,
            plan: session.plan.clone(),
            plan_rationale: session.plan_rationale.clone(),
            sub_topic_cursor: session.sub_topic_cursor,
            research_round: session.research_round,
            knowledge: session.knowledge.clone(),
            progress: session.progress.clone(),
            final_report: session.final_report.clone(),
            error_message: session.error_message.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct ResearchService {
    driver: StepDriver,
    scheduler: Option<DynScheduler>,
    default_model: String,
}

impl ResearchService {
    pub fn new(driver: StepDriver, default_model: impl Into<String>) -> Self {
        Self {
            driver,
            scheduler: None,
            default_model: default_model.into(),
        }
    }

    /// Hand `Continue` outcomes to `scheduler` instead of returning them to the
    /// caller for manual re-triggering.
    pub fn with_scheduler(mut self, scheduler: DynScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn driver(&self) -> &StepDriver {
        &self.driver
    }

    #[instrument(name = "service.create", skip(self, topic))]
    pub async fn create(
        &self,
        topic: &str,
        user_id: &str,
        model: Option<&str>,
    ) -> Result<ResearchSession, DeepDiveError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(DeepDiveError::InvalidInput("topic must not be empty".into()));
        }
        if user_id.trim().is_empty() {
            return Err(DeepDiveError::InvalidInput("user id must not be empty".into()));
        }
        let model = model
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(&self.default_model);

        let session = self
            .driver
            .store()
            .create_session(NewSession::new(topic, user_id, model))
            .await?;
        info!(session_id = %session.id, %model, "session created");
        Ok(session)
    }

    /// Run one `advance` for the caller's session. Scheduling failures are
    /// logged; the outcome of the step itself is still returned.
    #[instrument(name = "service.trigger", skip(self))]
    pub async fn trigger(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<AdvanceOutcome, DeepDiveError> {
        self.authorize(session_id, user_id).await?;
        let outcome = self.driver.advance(session_id).await?;

        if outcome.should_continue() {
            if let Some(scheduler) = &self.scheduler {
                if let Err(err) = scheduler.schedule(session_id.to_string()) {
                    warn!(session_id, error = %err, "failed to schedule next step");
                }
            }
        }
        Ok(outcome)
    }

    pub async fn status(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SessionView, DeepDiveError> {
        let session = self.authorize(session_id, user_id).await?;
        Ok(SessionView::from(&session))
    }

    pub async fn citations(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Vec<Citation>, DeepDiveError> {
        self.authorize(session_id, user_id).await?;
        Ok(self.driver.store().citations(session_id).await?)
    }

    /// Idempotent: canceling a terminal session returns it unchanged.
    #[instrument(name = "service.cancel", skip(self))]
    pub async fn cancel(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<SessionView, DeepDiveError> {
        self.authorize(session_id, user_id).await?;
        let session = self
            .driver
            .store()
            .cancel_session(session_id)
            .await?
            .ok_or_else(|| DeepDiveError::SessionNotFound(session_id.to_string()))?;
        info!(session_id, status = %session.status, "cancel requested");
        Ok(SessionView::from(&session))
    }

    async fn authorize(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<ResearchSession, DeepDiveError> {
        let session = self
            .driver
            .store()
            .load_session(session_id)
            .await?
            .ok_or_else(|| DeepDiveError::SessionNotFound(session_id.to_string()))?;
        if session.user_id != user_id {
            return Err(DeepDiveError::Unauthorized(session_id.to_string()));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverSettings, SkipReason};
    use crate::providers::Providers;
    use crate::store::{DynKnowledgeStore, InMemoryKnowledgeStore};
    use std::sync::Arc;

    fn service() -> ResearchService {
        let store: DynKnowledgeStore = Arc::new(InMemoryKnowledgeStore::new());
        let driver = StepDriver::new(store, Providers::stub(), DriverSettings::default());
        ResearchService::new(driver, "default-model")
    }

    #[tokio::test]
    async fn create_fills_default_model_and_rejects_blank_topic() {
        let service = service();
        let session = service.create("  quantum annealing ", "u1", None).await.unwrap();
        assert_eq!(session.topic, "quantum annealing");
        assert_eq!(session.model, "default-model");

        let err = service.create("   ", "u1", Some("m1")).await.unwrap_err();
        assert!(matches!(err, DeepDiveError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn other_users_are_refused() {
        let service = service();
        let session = service.create("topic", "u1", Some("m1")).await.unwrap();

        let err = service.trigger(&session.id, "u2").await.unwrap_err();
        assert!(matches!(err, DeepDiveError::Unauthorized(_)));

        let err = service.status("missing", "u1").await.unwrap_err();
        assert!(matches!(err, DeepDiveError::SessionNotFound(_)));

        let view = service.status(&session.id, "u1").await.unwrap();
        assert_eq!(view.phase, Phase::Planning);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_advancing() {
        let service = service();
        let session = service.create("topic", "u1", Some("m1")).await.unwrap();

        let first = service.cancel(&session.id, "u1").await.unwrap();
        let second = service.cancel(&session.id, "u1").await.unwrap();
        assert_eq!(first.status, SessionStatus::Canceled);
        assert_eq!(second.status, SessionStatus::Canceled);

        let outcome = service.trigger(&session.id, "u1").await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Skipped(SkipReason::Terminal(SessionStatus::Canceled))
        );
    }
}
