//! Topic decomposition and sufficiency decisions.
//!
//! The planner wraps two model calls: an initial decomposition of a topic into
//! sub-topics, and a check of whether the knowledge gathered so far suffices
//! for a long-form report. Model and transport failures propagate as
//! [`StepError::Model`]; retries are the caller's business.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::StepError;
use crate::prompts;
use crate::providers::{CompletionRequest, DynLanguageModel, ModelTask};

/// Upper bound on queries returned by a sufficiency check.
pub const MAX_FOLLOW_UP_QUERIES: usize = 10;

static LIST_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\d+\s*[.):]|[-*•])\s*(.*)$").expect("invalid list item regex")
});

/// Initial decomposition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub sub_topics: Vec<String>,
    pub rationale: String,
}

/// Result of asking whether research can stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SufficiencyVerdict {
    pub sufficient: bool,
    pub queries: Vec<String>,
    /// Always present, even when `sufficient` is true.
    pub narrative: String,
}

#[derive(Clone)]
pub struct Planner {
    model: DynLanguageModel,
}

impl Planner {
    pub fn new(model: DynLanguageModel) -> Self {
        Self { model }
    }

    #[instrument(name = "planner.generate_plan", skip(self))]
    pub async fn generate_plan(
        &self,
        topic: &str,
        model: &str,
        max_sub_topics: usize,
    ) -> Result<ResearchPlan, StepError> {
        let reply = self
            .model
            .complete(CompletionRequest::new(
                ModelTask::Plan,
                model,
                prompts::PLAN_SYSTEM,
                prompts::plan_prompt(topic, max_sub_topics),
            ))
            .await
            .map_err(|err| StepError::model("planning", err))?;

        let mut plan = parse_plan(&reply);
        if plan.sub_topics.is_empty() {
            warn!(%topic, "plan reply contained no list items; researching the topic directly");
            plan.sub_topics.push(topic.trim().to_string());
        }
        plan.sub_topics.truncate(max_sub_topics);

        debug!(sub_topics = plan.sub_topics.len(), "plan generated");
        Ok(plan)
    }

    /// Decide whether `digest` is enough to write the report. An empty digest
    /// means nothing has been learned yet.
    #[instrument(name = "planner.evaluate_sufficiency", skip(self, digest), fields(digest_len = digest.len()))]
    pub async fn evaluate_sufficiency(
        &self,
        topic: &str,
        digest: &str,
        model: &str,
    ) -> Result<SufficiencyVerdict, StepError> {
        let reply = self
            .model
            .complete(CompletionRequest::new(
                ModelTask::Sufficiency,
                model,
                prompts::SUFFICIENCY_SYSTEM,
                prompts::sufficiency_prompt(topic, digest),
            ))
            .await
            .map_err(|err| StepError::model("sufficiency", err))?;

        parse_sufficiency(&reply).map_err(|reason| StepError::unparseable("sufficiency", reason))
    }
}

/// Split model output into a leading rationale and a trailing numbered list.
///
/// List items lose their ordinal and surrounding whitespace; blank lines and
/// duplicate items are dropped.
pub fn parse_plan(text: &str) -> ResearchPlan {
    let mut rationale = Vec::new();
    let mut sub_topics: Vec<String> = Vec::new();
    let mut seen = HashSet::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match LIST_ITEM.captures(trimmed) {
            Some(caps) => {
                let item = caps[1].trim().trim_matches('*').trim().to_string();
                if !item.is_empty() && seen.insert(item.to_lowercase()) {
                    sub_topics.push(item);
                }
            }
            None if sub_topics.is_empty() => rationale.push(trimmed.to_string()),
            None => {}
        }
    }

    ResearchPlan {
        sub_topics,
        rationale: rationale.join(" "),
    }
}

/// Locate the JSON object in a model reply, tolerating code fences and prose.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[derive(Deserialize)]
struct RawVerdict {
    sufficient: bool,
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    narrative: String,
}

pub fn parse_sufficiency(text: &str) -> Result<SufficiencyVerdict, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object in reply".to_string())?;
    let raw: RawVerdict = serde_json::from_str(json).map_err(|err| err.to_string())?;

    let mut seen = HashSet::new();
    let queries: Vec<String> = raw
        .queries
        .into_iter()
        .map(|query| query.trim().to_string())
        .filter(|query| !query.is_empty() && seen.insert(query.to_lowercase()))
        .take(MAX_FOLLOW_UP_QUERIES)
        .collect();

    let narrative: String = match raw.narrative.trim() {
        "" if raw.sufficient => "Gathered knowledge is sufficient; ready to write the report.".into(),
        "" if queries.is_empty() => "No further queries proposed; moving on to the report.".into(),
        "" => format!("Researching {} more queries: {}.", queries.len(), queries.join("; ")),
        narrative => narrative.to_string(),
    };

    Ok(SufficiencyVerdict {
        sufficient: raw.sufficient,
        queries,
        narrative,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LanguageModel;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedReply(&'static str);

    #[async_trait]
    impl LanguageModel for FixedReply {
        async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl LanguageModel for Failing {
        async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
            anyhow::bail!("upstream 502")
        }
    }

    #[test]
    fn plan_splits_rationale_and_items() {
        let plan = parse_plan(
            "Annealing is best understood historically and then by use.\n\
             It also has hardware limits.\n\n\
             1. History of quantum annealing\n\
             \n\
             2)   Commercial applications  \n\
             3. **Hardware constraints**\n",
        );

        assert_eq!(
            plan.rationale,
            "Annealing is best understood historically and then by use. It also has hardware limits."
        );
        assert_eq!(
            plan.sub_topics,
            vec![
                "History of quantum annealing",
                "Commercial applications",
                "Hardware constraints"
            ]
        );
    }

    #[test]
    fn plan_drops_duplicates_and_blank_items() {
        let plan = parse_plan("1. history\n2. \n3. History\n- applications");
        assert_eq!(plan.sub_topics, vec!["history", "applications"]);
        assert!(plan.rationale.is_empty());
    }

    #[test]
    fn sufficiency_parses_fenced_json_and_caps_queries() {
        let queries: Vec<String> = (0..14).map(|i| format!("q{i}")).collect();
        let reply = format!(
            "```json\n{}\n```",
            serde_json::json!({ "sufficient": false, "queries": queries, "narrative": "" })
        );
        let verdict = parse_sufficiency(&reply).unwrap();

        assert!(!verdict.sufficient);
        assert_eq!(verdict.queries.len(), MAX_FOLLOW_UP_QUERIES);
        assert!(verdict.narrative.starts_with("Researching 10 more queries"));
    }

    #[test]
    fn sufficient_verdict_still_has_narrative() {
        let verdict = parse_sufficiency(r#"{"sufficient": true}"#).unwrap();
        assert!(verdict.sufficient);
        assert!(verdict.narrative.contains("ready to write the report"));
    }

    #[test]
    fn sufficiency_without_json_is_an_error() {
        assert!(parse_sufficiency("I think we are done.").is_err());
    }

    #[tokio::test]
    async fn empty_plan_falls_back_to_topic() {
        let planner = Planner::new(Arc::new(FixedReply("Nothing useful here.")));
        let plan = planner
            .generate_plan("quantum annealing", "m1", 10)
            .await
            .unwrap();
        assert_eq!(plan.sub_topics, vec!["quantum annealing"]);
    }

    #[tokio::test]
    async fn model_failure_propagates() {
        let planner = Planner::new(Arc::new(Failing));
        let err = planner
            .evaluate_sufficiency("topic", "", "m1")
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Model { stage: "sufficiency", .. }));
        assert!(err.to_string().contains("upstream 502"));
    }
}
