use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, Pool, Postgres, Row};
use tracing::debug;

use super::{Claim, CommitOutcome, KnowledgeStore, Rejection};
use crate::error::StoreError;
use crate::progress::ProgressEntry;
use crate::session::{
    Citation, KnowledgeEntry, NewCitation, NewSession, Phase, ProcessingLease, ResearchSession,
    SessionStatus, SourceRef, SubTopic,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SESSION_COLUMNS: &str = "id, user_id, model, topic, status, phase, plan, plan_rationale, \
     sub_topic_cursor, research_round, progress, error_message, lease_token, claimed_at, \
     created_at, updated_at";

/// Postgres-backed store. Claims lock the session row with
/// `FOR UPDATE SKIP LOCKED`, so concurrent claimers never block each other.
#[derive(Clone)]
pub struct PostgresKnowledgeStore {
    pool: Pool<Postgres>,
}

impl PostgresKnowledgeStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.pool.execute(SCHEMA).await?;
        Ok(())
    }

    async fn lease_state(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        session_id: &str,
    ) -> Result<Option<(SessionStatus, Option<String>)>, StoreError> {
        let row = sqlx::query(
            "SELECT status, lease_token FROM research_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(session_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| -> Result<(SessionStatus, Option<String>), StoreError> {
            let status: String = row.try_get("status")?;
            let status = SessionStatus::parse(&status)
                .ok_or_else(|| StoreError::corrupt(session_id, format!("unknown status {status}")))?;
            Ok((status, row.try_get("lease_token")?))
        })
        .transpose()
    }
}

fn session_from_row(
    row: &PgRow,
    knowledge: Vec<KnowledgeEntry>,
    final_report: Option<String>,
) -> Result<ResearchSession, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| StoreError::corrupt(&id, format!("unknown status {status}")))?;
    let phase: i16 = row.try_get("phase")?;
    let phase = u8::try_from(phase)
        .ok()
        .and_then(Phase::from_index)
        .ok_or_else(|| StoreError::corrupt(&id, format!("unknown phase {phase}")))?;
    let cursor: i32 = row.try_get("sub_topic_cursor")?;
    let round: i32 = row.try_get("research_round")?;
    let lease_token: Option<String> = row.try_get("lease_token")?;
    let claimed_at: Option<DateTime<Utc>> = row.try_get("claimed_at")?;
    let Json(plan): Json<Vec<SubTopic>> = row.try_get("plan")?;
    let Json(progress): Json<Vec<ProgressEntry>> = row.try_get("progress")?;

    let session = ResearchSession {
        user_id: row.try_get("user_id")?,
        model: row.try_get("model")?,
        topic: row.try_get("topic")?,
        status,
        phase,
        plan,
        plan_rationale: row.try_get("plan_rationale")?,
        sub_topic_cursor: usize::try_from(cursor)
            .map_err(|_| StoreError::corrupt(&id, "negative sub_topic_cursor"))?,
        research_round: u32::try_from(round)
            .map_err(|_| StoreError::corrupt(&id, "negative research_round"))?,
        knowledge,
        progress,
        final_report,
        error_message: row.try_get("error_message")?,
        lease: lease_token.zip(claimed_at).map(|(token, claimed_at)| ProcessingLease {
            token,
            claimed_at,
        }),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    };
    session
        .validate()
        .map_err(|reason| StoreError::corrupt(&session.id, reason))?;
    Ok(session)
}

fn knowledge_from_row(row: &PgRow) -> Result<KnowledgeEntry, StoreError> {
    let step: i32 = row.try_get("plan_step")?;
    let Json(sources): Json<Vec<SourceRef>> = row.try_get("sources")?;
    Ok(KnowledgeEntry {
        step: usize::try_from(step)
            .map_err(|_| StoreError::Backend(format!("negative plan step {step}")))?,
        source_query: row.try_get("source_query")?,
        summary: row.try_get("summary")?,
        sources,
        follow_up: row.try_get("follow_up")?,
        follow_up_consumed: row.try_get("follow_up_consumed")?,
    })
}

fn citation_from_row(row: &PgRow) -> Result<Citation, StoreError> {
    let index: i32 = row.try_get("citation_index")?;
    Ok(Citation {
        index: u32::try_from(index)
            .map_err(|_| StoreError::Backend(format!("negative citation index {index}")))?,
        query: row.try_get("query")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        snippet: row.try_get("snippet")?,
        content: row.try_get("content")?,
        degraded: row.try_get("degraded")?,
        fetched_at: row.try_get("fetched_at")?,
    })
}

#[async_trait]
impl KnowledgeStore for PostgresKnowledgeStore {
    async fn create_session(&self, input: NewSession) -> Result<ResearchSession, StoreError> {
        let session = ResearchSession::new(input);
        let inserted = sqlx::query(
            r#"
            INSERT INTO research_sessions (
                id, user_id, model, topic, status, phase, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.model)
        .bind(&session.topic)
        .bind(session.status.as_str())
        .bind(session.phase.index() as i16)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Conflict(session.id));
        }
        Ok(session)
    }

    async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ResearchSession>, StoreError> {
        // One snapshot across the three tables so a concurrent commit is seen whole.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let query = format!("SELECT {SESSION_COLUMNS} FROM research_sessions WHERE id = $1");
        let Some(row) = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let knowledge = sqlx::query(
            "SELECT plan_step, source_query, summary, sources, follow_up, follow_up_consumed \
             FROM research_knowledge WHERE session_id = $1 ORDER BY entry_index",
        )
        .bind(session_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(knowledge_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let final_report: Option<String> =
            sqlx::query_scalar("SELECT report FROM research_reports WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        session_from_row(&row, knowledge, final_report).map(Some)
    }

    async fn try_claim(&self, session_id: &str, lease_ttl: Duration) -> Result<Claim, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT status, lease_token, claimed_at FROM research_sessions \
             WHERE id = $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            // Either missing, or another transaction is claiming it right now.
            let exists = sqlx::query("SELECT 1 FROM research_sessions WHERE id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return Ok(if exists { Claim::Busy } else { Claim::NotFound });
        };

        let status: String = row.try_get("status")?;
        let status = SessionStatus::parse(&status)
            .ok_or_else(|| StoreError::corrupt(session_id, format!("unknown status {status}")))?;
        if status != SessionStatus::Pending {
            tx.rollback().await?;
            return Ok(Claim::Inactive(status));
        }

        let token: Option<String> = row.try_get("lease_token")?;
        let claimed_at: Option<DateTime<Utc>> = row.try_get("claimed_at")?;
        if let Some((token, claimed_at)) = token.zip(claimed_at) {
            let held = ProcessingLease { token, claimed_at };
            if !held.is_expired(lease_ttl, Utc::now()) {
                tx.rollback().await?;
                return Ok(Claim::Busy);
            }
            debug!(session_id, stale_token = %held.token, "taking over expired lease");
        }

        let lease = ProcessingLease::acquire();
        sqlx::query(
            "UPDATE research_sessions SET lease_token = $2, claimed_at = $3, updated_at = $3 \
             WHERE id = $1",
        )
        .bind(session_id)
        .bind(&lease.token)
        .bind(lease.claimed_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        match self.load_session(session_id).await? {
            Some(session) => Ok(Claim::Acquired(session)),
            None => Ok(Claim::NotFound),
        }
    }

    async fn record_citation(
        &self,
        session_id: &str,
        citation: NewCitation,
    ) -> Result<Citation, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE research_sessions SET citation_count = citation_count + 1 \
             WHERE id = $1 RETURNING citation_count",
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(StoreError::Backend(format!(
                "cannot record citation for unknown session {session_id}"
            )));
        };
        let index: i32 = row.try_get("citation_count")?;
        let citation = citation.into_citation(index as u32);

        sqlx::query(
            r#"
            INSERT INTO research_citations (
                session_id, citation_index, query, url, title, snippet, content, degraded, fetched_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(session_id)
        .bind(index)
        .bind(&citation.query)
        .bind(&citation.url)
        .bind(&citation.title)
        .bind(&citation.snippet)
        .bind(&citation.content)
        .bind(citation.degraded)
        .bind(citation.fetched_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(citation)
    }

    async fn citations(&self, session_id: &str) -> Result<Vec<Citation>, StoreError> {
        let rows = sqlx::query(
            "SELECT citation_index, query, url, title, snippet, content, degraded, fetched_at \
             FROM research_citations WHERE session_id = $1 ORDER BY citation_index",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(citation_from_row).collect()
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

        let mut tx = self.pool.begin().await?;
        let Some((status, held)) = Self::lease_state(&mut tx, &session.id).await? else {
            return Err(StoreError::Backend(format!(
                "session {} vanished during a step",
                session.id
            )));
        };
        if held.as_deref() != Some(lease_token) {
            tx.rollback().await?;
            return Ok(CommitOutcome::Rejected(Rejection::LeaseLost));
        }
        if status != SessionStatus::Pending {
            sqlx::query(
                "UPDATE research_sessions SET lease_token = NULL, claimed_at = NULL WHERE id = $1",
            )
            .bind(&session.id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(CommitOutcome::Rejected(Rejection::NotPending(status)));
        }

        sqlx::query(
            r#"
            UPDATE research_sessions SET
                status = $2,
                phase = $3,
                plan = $4,
                plan_rationale = $5,
                sub_topic_cursor = $6,
                research_round = $7,
                progress = $8,
                error_message = $9,
                lease_token = NULL,
                claimed_at = NULL,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(&updated.id)
        .bind(updated.status.as_str())
        .bind(updated.phase.index() as i16)
        .bind(Json(&updated.plan))
        .bind(&updated.plan_rationale)
        .bind(updated.sub_topic_cursor as i32)
        .bind(updated.research_round as i32)
        .bind(Json(&updated.progress))
        .bind(&updated.error_message)
        .bind(updated.updated_at)
        .execute(&mut *tx)
        .await?;

        // Entries are append-only; only the consumed flag changes after insert.
        for (position, entry) in updated.knowledge.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO research_knowledge (
                    session_id, entry_index, plan_step, source_query, summary, sources,
                    follow_up, follow_up_consumed
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                ON CONFLICT (session_id, entry_index)
                DO UPDATE SET follow_up_consumed = EXCLUDED.follow_up_consumed
                "#,
            )
            .bind(&updated.id)
            .bind(position as i32)
            .bind(entry.step as i32)
            .bind(&entry.source_query)
            .bind(&entry.summary)
            .bind(Json(&entry.sources))
            .bind(&entry.follow_up)
            .bind(entry.follow_up_consumed)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(report) = &updated.final_report {
            sqlx::query(
                "INSERT INTO research_reports (session_id, report, created_at) \
                 VALUES ($1, $2, $3) ON CONFLICT (session_id) DO NOTHING",
            )
            .bind(&updated.id)
            .bind(report)
            .bind(updated.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(CommitOutcome::Committed)
    }

    async fn fail_session(
        &self,
        session_id: &str,
        lease_token: &str,
        message: &str,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some((status, held)) = Self::lease_state(&mut tx, session_id).await? else {
            return Err(StoreError::Backend(format!(
                "session {session_id} vanished during a step"
            )));
        };
        if held.as_deref() != Some(lease_token) {
            tx.rollback().await?;
            return Ok(CommitOutcome::Rejected(Rejection::LeaseLost));
        }

        let outcome = if status == SessionStatus::Pending {
            sqlx::query(
                "UPDATE research_sessions SET status = $2, error_message = $3, \
                 lease_token = NULL, claimed_at = NULL, updated_at = now() WHERE id = $1",
            )
            .bind(session_id)
            .bind(SessionStatus::Error.as_str())
            .bind(message)
            .execute(&mut *tx)
            .await?;
            CommitOutcome::Committed
        } else {
            sqlx::query(
                "UPDATE research_sessions SET lease_token = NULL, claimed_at = NULL WHERE id = $1",
            )
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
            CommitOutcome::Rejected(Rejection::NotPending(status))
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn cancel_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ResearchSession>, StoreError> {
        sqlx::query(
            "UPDATE research_sessions SET status = $2, updated_at = now() \
             WHERE id = $1 AND status = $3",
        )
        .bind(session_id)
        .bind(SessionStatus::Canceled.as_str())
        .bind(SessionStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        self.load_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_commit_roundtrip() -> anyhow::Result<()> {
        let Some(url) = std::env::var("DEEPDIVE_TEST_DATABASE_URL").ok() else {
            // Skip when no test database is provisioned.
            return Ok(());
        };
        let store = PostgresKnowledgeStore::connect(&url).await?;
        let session = store
            .create_session(NewSession::new("quantum annealing", "u1", "m1"))
            .await?;

        let Claim::Acquired(mut claimed) = store.try_claim(&session.id, Duration::from_secs(60)).await?
        else {
            anyhow::bail!("fresh session should be claimable");
        };
        assert!(matches!(
            store.try_claim(&session.id, Duration::from_secs(60)).await?,
            Claim::Busy
        ));

        let token = claimed.lease.clone().map(|lease| lease.token).unwrap_or_default();
        claimed.plan.push(SubTopic::new("history", 1));
        claimed.phase = Phase::Researching;
        assert_eq!(store.commit_step(&claimed, &token).await?, CommitOutcome::Committed);

        let first = store
            .record_citation(
                &session.id,
                NewCitation {
                    query: "history".into(),
                    url: "https://example.com/1".into(),
                    title: "One".into(),
                    snippet: "s".into(),
                    content: "c".into(),
                    degraded: false,
                },
            )
            .await?;
        assert_eq!(first.index, 1);

        let loaded = store.load_session(&session.id).await?.expect("session exists");
        assert_eq!(loaded.plan.len(), 1);
        assert!(!loaded.is_processing());
        Ok(())
    }
}
