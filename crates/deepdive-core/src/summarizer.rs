//! Citation-annotated summaries of fetched sources.

use std::collections::{BTreeSet, HashSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::error::StepError;
use crate::planner::extract_json_object;
use crate::prompts;
use crate::providers::{CompletionRequest, DynLanguageModel, ModelTask};
use crate::session::{Citation, SourceRef};

static GROUPED_CITATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(\d+(?:\s*,\s*\d+)+)\]").expect("invalid grouped citation regex")
});
static CITATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s?\[(\d+)\]").expect("invalid citation regex"));
static CITATION_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\s?\[\d+\])+").expect("invalid citation run regex"));
static REFERENCE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\[\d+\]|[-*•]|\d+[.)]|<?https?://)").expect("invalid reference line regex")
});
static REFERENCES_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:#+\s*|\*\*)?(?:references|sources|bibliography)\s*:?\s*(?:\*\*)?\s*$")
        .expect("invalid references heading regex")
});

/// Citations kept on a single claim; extra adjacent brackets are dropped.
pub const MAX_CITATIONS_PER_CLAIM: usize = 3;

/// Summary of one batch of citations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub summary_text: String,
    pub sources: Vec<SourceRef>,
}

/// Merged summary for a sub-topic plus an optional research gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Findings {
    pub summary: String,
    pub needs_more_research: Option<String>,
}

#[derive(Clone)]
pub struct Summarizer {
    model: DynLanguageModel,
}

impl Summarizer {
    pub fn new(model: DynLanguageModel) -> Self {
        Self { model }
    }

    /// Condense a small batch of citations into one self-contained passage.
    #[instrument(name = "summarizer.summarize", skip(self, batch), fields(batch = batch.len()))]
    pub async fn summarize(
        &self,
        topic: &str,
        sub_topic: &str,
        batch: &[Citation],
        model: &str,
    ) -> Result<BatchSummary, StepError> {
        let reply = self
            .model
            .complete(CompletionRequest::new(
                ModelTask::Summarize,
                model,
                prompts::SUMMARIZE_SYSTEM,
                prompts::summarize_prompt(topic, sub_topic, batch),
            ))
            .await
            .map_err(|err| StepError::model("summarization", err))?;

        let allowed: HashSet<u32> = batch.iter().map(|citation| citation.index).collect();
        let (summary_text, cited) = sanitize_citations(&reply, &allowed);
        if summary_text.is_empty() {
            return Err(StepError::unparseable("summarization", "empty summary"));
        }

        // A summary that cites nothing still derives from the whole batch.
        let sources = batch
            .iter()
            .filter(|citation| cited.is_empty() || cited.contains(&citation.index))
            .map(Citation::source_ref)
            .collect();

        Ok(BatchSummary {
            summary_text,
            sources,
        })
    }

    /// Merge partial summaries and ask for the most important remaining gap.
    #[instrument(name = "summarizer.summarize_findings", skip(self, partials, allowed), fields(partials = partials.len()))]
    pub async fn summarize_findings(
        &self,
        topic: &str,
        sub_topic: &str,
        partials: &[String],
        allowed: &HashSet<u32>,
        model: &str,
    ) -> Result<Findings, StepError> {
        let reply = self
            .model
            .complete(CompletionRequest::new(
                ModelTask::Findings,
                model,
                prompts::FINDINGS_SYSTEM,
                prompts::findings_prompt(topic, sub_topic, partials),
            ))
            .await
            .map_err(|err| StepError::model("findings", err))?;

        let (summary, needs_more_research) = match parse_findings(&reply) {
            Some(parsed) => parsed,
            None => {
                warn!(%sub_topic, "findings reply was not JSON; keeping it as plain summary");
                (reply, None)
            }
        };

        let (summary, _) = sanitize_citations(&summary, allowed);
        if summary.is_empty() {
            return Err(StepError::unparseable("findings", "empty summary"));
        }

        Ok(Findings {
            summary,
            needs_more_research,
        })
    }
}

#[derive(Deserialize)]
struct RawFindings {
    summary: String,
    #[serde(default)]
    needs_more_research: Option<String>,
}

fn parse_findings(reply: &str) -> Option<(String, Option<String>)> {
    let raw: RawFindings = serde_json::from_str(extract_json_object(reply)?).ok()?;
    let gap = raw
        .needs_more_research
        .map(|gap| gap.trim().to_string())
        .filter(|gap| !gap.is_empty() && !gap.eq_ignore_ascii_case("none"));
    Some((raw.summary, gap))
}

/// Normalize inline citations.
///
/// Grouped brackets (`[1, 2]`) become `[1][2]`, indices outside `allowed` are
/// removed, adjacent brackets are capped at [`MAX_CITATIONS_PER_CLAIM`], and a
/// trailing references section is cut. Returns the cleaned text and the cited
/// indices in ascending order.
pub fn sanitize_citations(text: &str, allowed: &HashSet<u32>) -> (String, BTreeSet<u32>) {
    let body = strip_reference_section(text);

    let split = GROUPED_CITATION.replace_all(body, |caps: &Captures| {
        caps[1]
            .split(',')
            .map(|index| format!("[{}]", index.trim()))
            .collect::<String>()
    });

    let known = CITATION.replace_all(&split, |caps: &Captures| {
        match caps[1].parse::<u32>() {
            Ok(index) if allowed.contains(&index) => caps[0].to_string(),
            _ => String::new(),
        }
    });

    let capped = CITATION_RUN.replace_all(&known, |caps: &Captures| {
        let run = &caps[0];
        let mut kept: Vec<&str> = Vec::new();
        for citation in CITATION.captures_iter(run) {
            let index = citation.get(1).map_or("", |m| m.as_str());
            if !kept.contains(&index) && kept.len() < MAX_CITATIONS_PER_CLAIM {
                kept.push(index);
            }
        }
        let lead = if run.starts_with(char::is_whitespace) { " " } else { "" };
        let brackets: String = kept.iter().map(|index| format!("[{index}]")).collect();
        format!("{lead}{brackets}")
    });

    let cited = CITATION
        .captures_iter(&capped)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .collect();

    (capped.trim().to_string(), cited)
}

/// Cut a references heading only when everything after it is a list of
/// sources; a heading followed by prose is kept.
fn strip_reference_section(text: &str) -> &str {
    REFERENCES_HEADING
        .find_iter(text)
        .find(|heading| {
            text[heading.end()..]
                .lines()
                .filter(|line| !line.trim().is_empty())
                .all(|line| REFERENCE_LINE.is_match(line))
        })
        .map_or(text, |heading| &text[..heading.start()])
}
