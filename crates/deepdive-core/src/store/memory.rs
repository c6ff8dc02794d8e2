use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::{Claim, CommitOutcome, KnowledgeStore, Rejection};
use crate::error::StoreError;
use crate::session::{
    Citation, NewCitation, NewSession, ProcessingLease, ResearchSession, SessionStatus,
};

/// In-memory store for tests, offline runs, and single-process deployments.
///
/// Each session lives behind a DashMap shard lock, so claims and commits are
/// atomic with respect to each other without holding a lock across an await.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    sessions: DashMap<String, ResearchSession>,
    citations: DashMap<String, Vec<Citation>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session as-is, bypassing creation defaults.
    pub fn insert(&self, session: ResearchSession) -> Result<(), StoreError> {
        session
            .validate()
            .map_err(|reason| StoreError::corrupt(&session.id, reason))?;
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn owns_lease(session: &ResearchSession, lease_token: &str) -> bool {
    session
        .lease
        .as_ref()
        .is_some_and(|lease| lease.token == lease_token)
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn create_session(&self, input: NewSession) -> Result<ResearchSession, StoreError> {
        let session = ResearchSession::new(input);
        if self.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(session.id));
        }
        self.sessions.insert(session.id.clone(), session.clone());
        self.citations.insert(session.id.clone(), Vec::new());
        Ok(session)
    }

    async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ResearchSession>, StoreError> {
        Ok(self.sessions.get(session_id).map(|entry| entry.clone()))
    }

    async fn try_claim(&self, session_id: &str, lease_ttl: Duration) -> Result<Claim, StoreError> {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return Ok(Claim::NotFound);
        };
        let session = entry.value_mut();

        if session.status != SessionStatus::Pending {
            return Ok(Claim::Inactive(session.status));
        }
        if let Some(lease) = &session.lease {
            if !lease.is_expired(lease_ttl, Utc::now()) {
                return Ok(Claim::Busy);
            }
            debug!(session_id, stale_token = %lease.token, "taking over expired lease");
        }

        session.lease = Some(ProcessingLease::acquire());
        session.updated_at = Utc::now();
        Ok(Claim::Acquired(session.clone()))
    }

    async fn record_citation(
        &self,
        session_id: &str,
        citation: NewCitation,
    ) -> Result<Citation, StoreError> {
        if !self.sessions.contains_key(session_id) {
            return Err(StoreError::Backend(format!(
                "cannot record citation for unknown session {session_id}"
            )));
        }
        let mut entry = self.citations.entry(session_id.to_string()).or_default();
        let next_index = entry.last().map(|last| last.index + 1).unwrap_or(1);
        let citation = citation.into_citation(next_index);
        entry.push(citation.clone());
        Ok(citation)
    }

    async fn citations(&self, session_id: &str) -> Result<Vec<Citation>, StoreError> {
        Ok(self
            .citations
            .get(session_id)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn commit_step(
        &self,
        session: &ResearchSession,
        lease_token: &str,
    ) -> Result<CommitOutcome, StoreError> {
        let mut updated = session.clone();
        updated.lease = None;
        updated.updated_at = Utc::now();
        updated
            .validate()
            .map_err(|reason| StoreError::corrupt(&session.id, reason))?;

        let Some(mut entry) = self.sessions.get_mut(&session.id) else {
            return Err(StoreError::Backend(format!(
                "session {} vanished during a step",
                session.id
            )));
        };
        let stored = entry.value_mut();

        if !owns_lease(stored, lease_token) {
            return Ok(CommitOutcome::Rejected(Rejection::LeaseLost));
        }
        if stored.status != SessionStatus::Pending {
            stored.lease = None;
            return Ok(CommitOutcome::Rejected(Rejection::NotPending(stored.status)));
        }

        *stored = updated;
        Ok(CommitOutcome::Committed)
    }

    async fn fail_session(
        &self,
        session_id: &str,
        lease_token: &str,
        message: &str,
    ) -> Result<CommitOutcome, StoreError> {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return Err(StoreError::Backend(format!(
                "session {session_id} vanished during a step"
            )));
        };
        let stored = entry.value_mut();

        if !owns_lease(stored, lease_token) {
            return Ok(CommitOutcome::Rejected(Rejection::LeaseLost));
        }
        stored.lease = None;
        stored.updated_at = Utc::now();
        if stored.status != SessionStatus::Pending {
            return Ok(CommitOutcome::Rejected(Rejection::NotPending(stored.status)));
        }

        stored.fail(message);
        Ok(CommitOutcome::Committed)
    }

    async fn cancel_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ResearchSession>, StoreError> {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        let stored = entry.value_mut();
        if stored.status == SessionStatus::Pending {
            stored.status = SessionStatus::Canceled;
            stored.updated_at = Utc::now();
        }
        Ok(Some(stored.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Phase, SubTopic};

    const TTL: Duration = Duration::from_secs(60);

    fn new_citation(url: &str) -> NewCitation {
        NewCitation {
            query: "history".into(),
            url: url.into(),
            title: "t".into(),
            snippet: "s".into(),
            content: "c".into(),
            degraded: false,
        }
    }

    async fn claimed(store: &InMemoryKnowledgeStore) -> (ResearchSession, String) {
        let session = store
            .create_session(NewSession::new("quantum annealing", "u1", "m1"))
            .await
            .unwrap();
        match store.try_claim(&session.id, TTL).await.unwrap() {
            Claim::Acquired(session) => {
                let token = session.lease.clone().unwrap().token;
                (session, token)
            }
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_claim_is_busy_until_commit() {
        let store = InMemoryKnowledgeStore::new();
        let (mut session, token) = claimed(&store).await;

        assert!(matches!(
            store.try_claim(&session.id, TTL).await.unwrap(),
            Claim::Busy
        ));

        session.plan.push(SubTopic::new("history", 1));
        session.phase = Phase::Researching;
        assert_eq!(
            store.commit_step(&session, &token).await.unwrap(),
            CommitOutcome::Committed
        );

        let stored = store.load_session(&session.id).await.unwrap().unwrap();
        assert!(!stored.is_processing());
        assert_eq!(stored.phase, Phase::Researching);
        assert!(matches!(
            store.try_claim(&session.id, TTL).await.unwrap(),
            Claim::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_and_stale_commit_rejected() {
        let store = InMemoryKnowledgeStore::new();
        let (session, stale_token) = claimed(&store).await;

        let Claim::Acquired(_) = store.try_claim(&session.id, Duration::ZERO).await.unwrap()
        else {
            panic!("expired lease should be reclaimable");
        };

        assert_eq!(
            store.commit_step(&session, &stale_token).await.unwrap(),
            CommitOutcome::Rejected(Rejection::LeaseLost)
        );
    }

    #[tokio::test]
    async fn cancel_during_step_discards_commit_and_releases_lease() {
        let store = InMemoryKnowledgeStore::new();
        let (mut session, token) = claimed(&store).await;

        let canceled = store.cancel_session(&session.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, SessionStatus::Canceled);

        session.plan.push(SubTopic::new("history", 1));
        session.phase = Phase::Researching;
        assert_eq!(
            store.commit_step(&session, &token).await.unwrap(),
            CommitOutcome::Rejected(Rejection::NotPending(SessionStatus::Canceled))
        );

        let stored = store.load_session(&session.id).await.unwrap().unwrap();
        assert!(stored.plan.is_empty());
        assert!(!stored.is_processing());
        assert!(matches!(
            store.try_claim(&session.id, TTL).await.unwrap(),
            Claim::Inactive(SessionStatus::Canceled)
        ));
    }

    #[tokio::test]
    async fn citation_indices_are_monotonic() {
        let store = InMemoryKnowledgeStore::new();
        let (session, _) = claimed(&store).await;

        let first = store
            .record_citation(&session.id, new_citation("https://a"))
            .await
            .unwrap();
        let second = store
            .record_citation(&session.id, new_citation("https://b"))
            .await
            .unwrap();

        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert_eq!(store.citations(&session.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_commit_is_refused() {
        let store = InMemoryKnowledgeStore::new();
        let (mut session, token) = claimed(&store).await;
        session.final_report = Some("too early".into());

        let err = store.commit_step(&session, &token).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn fail_sets_error_message_once() {
        let store = InMemoryKnowledgeStore::new();
        let (session, token) = claimed(&store).await;

        assert_eq!(
            store.fail_session(&session.id, &token, "boom").await.unwrap(),
            CommitOutcome::Committed
        );
        let stored = store.load_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert!(stored.final_report.is_none());
    }
}
