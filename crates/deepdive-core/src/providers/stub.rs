use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{CompletionRequest, ContentFetcher, LanguageModel, ModelTask, SearchHit, SearchProvider};
use crate::prompts::topic_line;

static SOURCE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[(\d+)\] ").expect("invalid source header regex"));

fn slug(text: &str) -> String {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Deterministic search results for offline runs.
pub struct StubSearch;

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, query: &str, count: usize) -> anyhow::Result<Vec<SearchHit>> {
        let slug = slug(query);
        Ok((1..=count.min(3))
            .map(|rank| SearchHit {
                url: format!("https://example.com/{slug}/{rank}"),
                title: format!("{query} (source {rank})"),
                snippet: format!("Overview {rank} of {query}."),
            })
            .collect())
    }
}

/// Returns a short synthetic page for any URL.
pub struct StubFetcher;

#[async_trait]
impl ContentFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        Ok(format!("# Offline copy\n\nPlaceholder content retrieved from {url}."))
    }
}

/// Produces well-formed replies for every model stage without network access.
pub struct StubLanguageModel;

#[async_trait]
impl LanguageModel for StubLanguageModel {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        let topic = topic_line(&request.prompt).unwrap_or("the topic").to_string();
        let reply = match request.task {
            ModelTask::Plan => format!(
                "The topic is split into its background, present state, and open questions.\n\n\
                 1. Background of {topic}\n\
                 2. Current state of {topic}\n\
                 3. Open questions in {topic}"
            ),
            ModelTask::Sufficiency => serde_json::json!({
                "sufficient": true,
                "queries": [],
                "narrative": format!("Enough material on {topic}; ready to write the report."),
            })
            .to_string(),
            ModelTask::Summarize => {
                let cites: String = SOURCE_HEADER
                    .captures_iter(&request.prompt)
                    .map(|caps| format!("[{}]", &caps[1]))
                    .collect();
                format!("Offline summary of the sources gathered for {topic} {cites}.")
            }
            ModelTask::Findings => {
                let merged = request
                    .prompt
                    .split("--- part ")
                    .skip(1)
                    .filter_map(|part| part.split_once("---\n").map(|(_, body)| body.trim()))
                    .collect::<Vec<_>>()
                    .join(" ");
                serde_json::json!({ "summary": merged, "needs_more_research": null }).to_string()
            }
            ModelTask::Report => {
                let body = request
                    .prompt
                    .split_once("Knowledge base:\n")
                    .map(|(_, kb)| kb)
                    .unwrap_or_default();
                format!("# {topic}\n\n## Findings\n\n{body}\n\n## Conclusion\n\nOffline report.")
            }
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::parse_plan;

    #[tokio::test]
    async fn stub_plan_is_parseable() {
        let reply = StubLanguageModel
            .complete(CompletionRequest::new(
                ModelTask::Plan,
                "m1",
                "",
                "Topic: quantum annealing\n\nPropose sub-topics.",
            ))
            .await
            .unwrap();
        let plan = parse_plan(&reply);
        assert_eq!(plan.sub_topics.len(), 3);
        assert_eq!(plan.sub_topics[0], "Background of quantum annealing");
    }

    #[tokio::test]
    async fn stub_search_caps_results() {
        let hits = StubSearch.search("Quantum Annealing", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].url, "https://example.com/quantum-annealing/1");
    }
}
