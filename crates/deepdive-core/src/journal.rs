//! Append-only JSONL record of finished sessions.
//!
//! Entries land in `<journal_dir>/YYYY/MM/session.jsonl`. Free text is scrubbed
//! for credentials before it is written; any scrub is also noted in a sibling
//! `audit.jsonl`. Files older than the retention window are pruned on write.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::warn;

use crate::config::LoggingConfig;
use crate::session::ResearchSession;

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

#[derive(Serialize)]
struct JournalRecord {
    timestamp: String,
    session_id: String,
    user_id: String,
    topic: String,
    status: String,
    research_rounds: u32,
    sub_topics: Vec<String>,
    sources: Vec<String>,
    report_chars: Option<usize>,
    error_message: Option<String>,
    redactions: Vec<&'static str>,
}

#[derive(Serialize)]
struct AuditRecord {
    timestamp: String,
    session_id: String,
    redactions: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct SessionJournal {
    base_dir: PathBuf,
    retention_days: u64,
}

impl SessionJournal {
    pub fn new(base_dir: impl Into<PathBuf>, retention_days: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention_days,
        }
    }

    /// `None` when no journal directory is configured.
    pub fn from_config(config: &LoggingConfig) -> Option<Self> {
        config
            .journal_dir
            .as_ref()
            .map(|dir| Self::new(dir, config.retention_days))
    }

    /// Append the terminal state of `session` along with the URLs it cited.
    pub fn record(&self, session: &ResearchSession, source_urls: &[String]) -> Result<()> {
        let timestamp = Utc::now();
        let mut redactions = BTreeSet::new();

        let record = JournalRecord {
            timestamp: timestamp.to_rfc3339(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            topic: sanitize_text(&session.topic, &mut redactions),
            status: session.status.to_string(),
            research_rounds: session.research_round,
            sub_topics: session
                .plan
                .iter()
                .map(|entry| sanitize_text(&entry.query, &mut redactions))
                .collect(),
            sources: source_urls
                .iter()
                .map(|url| sanitize_text(url, &mut redactions))
                .collect(),
            report_chars: session.final_report.as_ref().map(|report| report.chars().count()),
            error_message: session
                .error_message
                .as_deref()
                .map(|message| sanitize_text(message, &mut redactions)),
            redactions: redactions.iter().copied().collect(),
        };

        let month_dir = self
            .base_dir
            .join(format!("{:04}", timestamp.year()))
            .join(format!("{:02}", timestamp.month()));
        append_json_line(&month_dir.join("session.jsonl"), &record)?;

        if !record.redactions.is_empty() {
            let audit = AuditRecord {
                timestamp: record.timestamp.clone(),
                session_id: session.id.clone(),
                redactions: record.redactions.clone(),
            };
            append_json_line(&month_dir.join("audit.jsonl"), &audit)?;
            warn!(
                session_id = %session.id,
                fields = ?record.redactions,
                "redacted potential secrets from session journal"
            );
        }

        self.enforce_retention()
    }

    fn enforce_retention(&self) -> Result<()> {
        if self.retention_days == 0 || !self.base_dir.exists() {
            return Ok(());
        }
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(self.retention_days.saturating_mul(86_400)))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        prune_directory(&self.base_dir, cutoff)
    }
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create journal directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open journal file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{line}")
        .with_context(|| format!("failed to append journal entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<&'static str>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name);
        }
    }
    output
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{NewSession, Phase, SubTopic};
    use serde_json::Value;
    use tempfile::TempDir;

    fn failed_session() -> ResearchSession {
        let mut session = ResearchSession::new(NewSession::new(
            "rotate api_key=abcd1234 safely",
            "u1",
            "m1",
        ));
        session.plan.push(SubTopic::new("key rotation", 1));
        session.phase = Phase::Researching;
        session.fail("upstream said: bearer XYZ123 rejected");
        session
    }

    #[test]
    fn journal_redacts_and_writes_audit() -> Result<()> {
        let temp = TempDir::new()?;
        let journal = SessionJournal::new(temp.path(), 0);

        journal.record(
            &failed_session(),
            &["https://example.com/a?token=sk-abcdef1234567890abcd".to_string()],
        )?;

        let year_dir = temp.path().read_dir()?.next().unwrap()?.path();
        let month_dir = year_dir.read_dir()?.next().unwrap()?.path();
        let line = fs::read_to_string(month_dir.join("session.jsonl"))?;
        let record: Value = serde_json::from_str(line.trim())?;

        assert_eq!(record["status"], "error");
        assert_eq!(record["topic"], "rotate api_key=[REDACTED] safely");
        assert!(
            record["error_message"]
                .as_str()
                .unwrap()
                .contains("bearer [REDACTED]")
        );
        assert!(!record["sources"][0].as_str().unwrap().contains("sk-abcdef"));
        assert!(month_dir.join("audit.jsonl").exists());
        Ok(())
    }

    #[test]
    fn clean_session_writes_no_audit() -> Result<()> {
        let temp = TempDir::new()?;
        let journal = SessionJournal::new(temp.path(), 90);
        let mut session = ResearchSession::new(NewSession::new("quantum annealing", "u1", "m1"));
        session.plan.push(SubTopic::new("history", 1));
        session.phase = Phase::Compiling;
        session.complete("# Report".into());

        journal.record(&session, &[])?;

        let year_dir = temp.path().read_dir()?.next().unwrap()?.path();
        let month_dir = year_dir.read_dir()?.next().unwrap()?.path();
        assert!(month_dir.join("session.jsonl").exists());
        assert!(!month_dir.join("audit.jsonl").exists());
        Ok(())
    }

    #[test]
    fn journal_is_disabled_without_directory() {
        assert!(SessionJournal::from_config(&LoggingConfig::default()).is_none());
    }
}
