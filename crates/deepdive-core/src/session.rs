//! Research session records and their invariants.
//!
//! A [`ResearchSession`] is mutated exclusively by the step driver, one phase
//! at a time. Stores call [`ResearchSession::validate`] on every read and write
//! so a record that breaks an invariant never crosses the storage boundary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::progress::ProgressEntry;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    /// Never persisted; reported for a pending session whose lease is held.
    InProgress,
    Completed,
    Error,
    Canceled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Error | SessionStatus::Canceled
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            "canceled" => Some(SessionStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Macro-stage of a session (`currentStep` 0, 1, 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Researching,
    Compiling,
}

impl Phase {
    pub fn index(&self) -> u8 {
        match self {
            Phase::Planning => 0,
            Phase::Researching => 1,
            Phase::Compiling => 2,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Phase::Planning),
            1 => Some(Phase::Researching),
            2 => Some(Phase::Compiling),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Researching => "researching",
            Phase::Compiling => "compiling",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of research work in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTopic {
    pub query: String,
    /// Research pass that introduced this entry (1 = initial plan).
    pub round: u32,
}

impl SubTopic {
    pub fn new(query: impl Into<String>, round: u32) -> Self {
        Self {
            query: query.into(),
            round,
        }
    }
}

/// Structural reference from a knowledge entry to a recorded citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub citation_index: u32,
    pub url: String,
}

/// One persisted summarization result for a sub-topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Plan position this entry was researched from.
    pub step: usize,
    pub source_query: String,
    pub summary: String,
    pub sources: Vec<SourceRef>,
    /// Gap the summarizer asked to research next, if any.
    #[serde(default)]
    pub follow_up: Option<String>,
    /// Set once the follow-up has been folded into the plan.
    #[serde(default)]
    pub follow_up_consumed: bool,
}

impl KnowledgeEntry {
    pub fn pending_follow_up(&self) -> Option<&str> {
        if self.follow_up_consumed {
            return None;
        }
        self.follow_up
            .as_deref()
            .map(str::trim)
            .filter(|gap| !gap.is_empty())
    }
}

/// A fetched source, numbered for inline `[i]` citations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub index: u32,
    pub query: String,
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub content: String,
    /// Content is the search snippet because fetching the page failed.
    pub degraded: bool,
    pub fetched_at: DateTime<Utc>,
}

impl Citation {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            citation_index: self.index,
            url: self.url.clone(),
        }
    }
}

/// A citation before the store has assigned its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCitation {
    pub query: String,
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub content: String,
    pub degraded: bool,
}

impl NewCitation {
    pub fn into_citation(self, index: u32) -> Citation {
        Citation {
            index,
            query: self.query,
            url: self.url,
            title: self.title,
            snippet: self.snippet,
            content: self.content,
            degraded: self.degraded,
            fetched_at: Utc::now(),
        }
    }
}

/// Processing lease held by the execution currently advancing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingLease {
    pub token: String,
    pub claimed_at: DateTime<Utc>,
}

impl ProcessingLease {
    pub fn acquire() -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            claimed_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.claimed_at)
            .to_std()
            .map(|elapsed| elapsed >= ttl)
            .unwrap_or(false)
    }
}

/// Input for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub topic: String,
    pub user_id: String,
    pub model: String,
}

impl NewSession {
    pub fn new(
        topic: impl Into<String>,
        user_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            user_id: user_id.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: String,
    pub user_id: String,
    pub model: String,
    pub topic: String,
    pub status: SessionStatus,
    pub phase: Phase,
    pub plan: Vec<SubTopic>,
    pub plan_rationale: Option<String>,
    pub sub_topic_cursor: usize,
    /// Research passes started so far; bounded by `research.max_rounds`.
    pub research_round: u32,
    pub knowledge: Vec<KnowledgeEntry>,
    pub progress: Vec<ProgressEntry>,
    pub final_report: Option<String>,
    pub error_message: Option<String>,
    pub lease: Option<ProcessingLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchSession {
    pub fn new(input: NewSession) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id,
            model: input.model,
            topic: input.topic,
            status: SessionStatus::Pending,
            phase: Phase::Planning,
            plan: Vec::new(),
            plan_rationale: None,
            sub_topic_cursor: 0,
            research_round: 0,
            knowledge: Vec::new(),
            progress: Vec::new(),
            final_report: None,
            error_message: None,
            lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.lease.is_some()
    }

    /// Status as shown to readers: a held lease on a pending session reads as
    /// `in_progress`.
    pub fn display_status(&self) -> SessionStatus {
        match (self.status, self.is_processing()) {
            (SessionStatus::Pending, true) => SessionStatus::InProgress,
            (status, _) => status,
        }
    }

    pub fn current_sub_topic(&self) -> Option<&SubTopic> {
        self.plan.get(self.sub_topic_cursor)
    }

    pub fn record_progress(&mut self, message: impl Into<String>) {
        self.progress.push(ProgressEntry::new(self.phase, message));
    }

    pub fn complete(&mut self, report: String) {
        self.status = SessionStatus::Completed;
        self.final_report = Some(report);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = SessionStatus::Error;
        self.error_message = Some(message.into());
    }

    /// Textual digest of everything learned so far, used by sufficiency checks.
    pub fn knowledge_digest(&self) -> String {
        self.knowledge
            .iter()
            .map(|entry| format!("## {}\n{}", entry.source_query, entry.summary.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Check the record-level invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.sub_topic_cursor > self.plan.len() {
            return Err(format!(
                "sub_topic_cursor {} exceeds plan length {}",
                self.sub_topic_cursor,
                self.plan.len()
            ));
        }
        if self.status == SessionStatus::InProgress {
            return Err("in_progress is a display status and cannot be stored".into());
        }
        if self.final_report.is_some() != (self.status == SessionStatus::Completed) {
            return Err(format!(
                "final report presence does not match status {}",
                self.status
            ));
        }
        if self.error_message.is_some() != (self.status == SessionStatus::Error) {
            return Err(format!(
                "error message presence does not match status {}",
                self.status
            ));
        }
        if self.phase != Phase::Planning && self.plan.is_empty() {
            return Err(format!("phase {} reached with an empty plan", self.phase));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ResearchSession {
        ResearchSession::new(NewSession::new("quantum annealing", "u1", "m1"))
    }

    #[test]
    fn new_session_starts_pending_at_planning() {
        let session = session();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.phase, Phase::Planning);
        assert!(session.plan.is_empty());
        assert!(session.validate().is_ok());
    }

    #[test]
    fn held_lease_reads_as_in_progress() {
        let mut session = session();
        session.lease = Some(ProcessingLease::acquire());
        assert_eq!(session.display_status(), SessionStatus::InProgress);
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[test]
    fn report_requires_completed_status() {
        let mut session = session();
        session.final_report = Some("orphan".into());
        assert!(session.validate().is_err());

        let mut session = self::session();
        session.plan.push(SubTopic::new("history", 1));
        session.phase = Phase::Compiling;
        session.complete("report".into());
        assert!(session.validate().is_ok());
    }

    #[test]
    fn cursor_past_plan_is_rejected() {
        let mut session = session();
        session.plan.push(SubTopic::new("history", 1));
        session.phase = Phase::Researching;
        session.sub_topic_cursor = 2;
        assert!(session.validate().is_err());
    }

    #[test]
    fn consumed_follow_up_is_not_pending() {
        let mut entry = KnowledgeEntry {
            step: 0,
            source_query: "history".into(),
            summary: "text".into(),
            sources: vec![],
            follow_up: Some("  early hardware  ".into()),
            follow_up_consumed: false,
        };
        assert_eq!(entry.pending_follow_up(), Some("early hardware"));
        entry.follow_up_consumed = true;
        assert_eq!(entry.pending_follow_up(), None);
    }

    #[test]
    fn lease_expiry_respects_ttl() {
        let lease = ProcessingLease {
            token: "t".into(),
            claimed_at: Utc::now() - chrono::Duration::seconds(120),
        };
        assert!(lease.is_expired(std::time::Duration::from_secs(60), Utc::now()));
        assert!(!lease.is_expired(std::time::Duration::from_secs(600), Utc::now()));
    }
}
