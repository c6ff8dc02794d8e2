//! Durable record of sessions, citations, knowledge, and reports.
//!
//! Backends must make [`KnowledgeStore::try_claim`] a single atomic
//! read-modify-write: of two concurrent claims on the same pending session,
//! exactly one may return [`Claim::Acquired`].

mod memory;
#[cfg(feature = "postgres-store")]
mod postgres;

pub use memory::InMemoryKnowledgeStore;
#[cfg(feature = "postgres-store")]
pub use postgres::PostgresKnowledgeStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::session::{Citation, NewCitation, NewSession, ResearchSession, SessionStatus};

/// Result of trying to take the processing lease on a session.
#[derive(Debug, Clone)]
pub enum Claim {
    /// The caller now owns the session until it commits or fails the step.
    Acquired(ResearchSession),
    /// Another execution holds a live lease.
    Busy,
    /// The session is terminal.
    Inactive(SessionStatus),
    NotFound,
}

/// Why a commit was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The session left `pending` (canceled) while the step ran.
    NotPending(SessionStatus),
    /// The lease expired and was taken over by another execution.
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Rejected(Rejection),
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn create_session(&self, input: NewSession) -> Result<ResearchSession, StoreError>;

    async fn load_session(&self, session_id: &str)
    -> Result<Option<ResearchSession>, StoreError>;

    /// Atomically select the session iff it is pending with no live lease, and
    /// mark it as processing before returning.
    async fn try_claim(&self, session_id: &str, lease_ttl: Duration)
    -> Result<Claim, StoreError>;

    /// Persist one citation immediately, assigning the next session-scoped index.
    async fn record_citation(
        &self,
        session_id: &str,
        citation: NewCitation,
    ) -> Result<Citation, StoreError>;

    /// All citations of a session in index order.
    async fn citations(&self, session_id: &str) -> Result<Vec<Citation>, StoreError>;

    /// Persist the step's mutations and release the lease as one unit. Applied
    /// only while the session is still pending and `lease_token` still owns it.
    async fn commit_step(
        &self,
        session: &ResearchSession,
        lease_token: &str,
    ) -> Result<CommitOutcome, StoreError>;

    /// Move a claimed session to `error` and release the lease. A session that
    /// was canceled meanwhile keeps its status; only the lease is released.
    async fn fail_session(
        &self,
        session_id: &str,
        lease_token: &str,
        message: &str,
    ) -> Result<CommitOutcome, StoreError>;

    /// Transition a pending session to `canceled`. Terminal sessions are
    /// returned unchanged. `None` when the session does not exist.
    async fn cancel_session(&self, session_id: &str)
    -> Result<Option<ResearchSession>, StoreError>;
}

pub type DynKnowledgeStore = Arc<dyn KnowledgeStore>;
