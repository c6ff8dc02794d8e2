use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::session::Phase;

/// Human-readable step description streamed to readers of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub phase: Phase,
    pub message: String,
    pub timestamp_ms: u64,
}

impl ProgressEntry {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            phase,
            message: message.into(),
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStep {
    pub index: usize,
    pub phase: Phase,
    pub message: String,
}

/// Numbered view over a session's progress log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub steps: Vec<ProgressStep>,
}

impl ProgressSummary {
    pub fn from_entries(entries: &[ProgressEntry]) -> Self {
        let steps = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| ProgressStep {
                index: idx + 1,
                phase: entry.phase,
                message: entry.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No progress recorded.".to_string();
        }
        let mut output = String::from("### Progress\n");
        for step in &self.steps {
            let _ = writeln!(output, "{}. [{}] {}", step.index, step.phase, step.message);
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no progress recorded".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for step in &self.steps {
            let label = sanitize_mermaid(&format!("{}: {}", step.phase, step.message));
            let _ = writeln!(output, "  step{}[\"{label}\"]", step.index);
        }
        for idx in 1..self.steps.len() {
            let _ = writeln!(output, "  step{idx} --> step{}", idx + 1);
        }
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_numbers_steps_in_order() {
        let entries = vec![
            ProgressEntry::new(Phase::Planning, "planned 2 sub-topics"),
            ProgressEntry::new(Phase::Researching, "researched history"),
        ];
        let markdown = ProgressSummary::from_entries(&entries).render_markdown();

        assert!(markdown.contains("1. [planning] planned 2 sub-topics"));
        assert!(markdown.contains("2. [researching] researched history"));
    }

    #[test]
    fn mermaid_escapes_citation_brackets() {
        let entries = vec![
            ProgressEntry::new(Phase::Researching, "summary cites [1]"),
            ProgressEntry::new(Phase::Compiling, "report ready"),
        ];
        let mermaid = ProgressSummary::from_entries(&entries).render_mermaid();

        assert!(mermaid.starts_with("flowchart TD"));
        assert!(mermaid.contains("(1)"));
        assert!(mermaid.contains("step1 --> step2"));
    }
}
