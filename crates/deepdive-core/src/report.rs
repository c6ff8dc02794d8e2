use std::fmt::Write as _;

use tracing::instrument;

use crate::error::StepError;
use crate::prompts;
use crate::providers::{CompletionRequest, DynLanguageModel, ModelTask};
use crate::session::{Citation, KnowledgeEntry};

/// Concatenate knowledge entries and the citations they reference.
pub fn build_knowledge_base(entries: &[KnowledgeEntry], citations: &[Citation]) -> String {
    let mut output = String::new();
    for entry in entries {
        let _ = writeln!(output, "## {}\n{}\n", entry.source_query, entry.summary.trim());
    }

    let mut referenced: Vec<&Citation> = citations
        .iter()
        .filter(|citation| {
            entries.iter().any(|entry| {
                entry
                    .sources
                    .iter()
                    .any(|source| source.citation_index == citation.index)
            })
        })
        .collect();
    referenced.sort_by_key(|citation| citation.index);

    if !referenced.is_empty() {
        output.push_str("## Sources\n");
        for citation in referenced {
            let _ = writeln!(output, "[{}] {} - {}", citation.index, citation.title, citation.url);
        }
    }
    output
}

#[derive(Clone)]
pub struct ReportCompiler {
    model: DynLanguageModel,
}

impl ReportCompiler {
    pub fn new(model: DynLanguageModel) -> Self {
        Self { model }
    }

    /// Produce the final long-form report. The reply is returned verbatim.
    #[instrument(name = "report.compile", skip(self, knowledge_base), fields(kb_len = knowledge_base.len()))]
    pub async fn compile(
        &self,
        topic: &str,
        knowledge_base: &str,
        model: &str,
    ) -> Result<String, StepError> {
        let report = self
            .model
            .complete(CompletionRequest::new(
                ModelTask::Report,
                model,
                prompts::REPORT_SYSTEM,
                prompts::report_prompt(topic, knowledge_base),
            ))
            .await
            .map_err(|err| StepError::model("report", err))?;

        if report.trim().is_empty() {
            return Err(StepError::unparseable("report", "empty report"));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{NewCitation, SourceRef};

    #[test]
    fn knowledge_base_lists_only_referenced_sources() {
        let citations: Vec<Citation> = (1..=3)
            .map(|index| {
                NewCitation {
                    query: "history".into(),
                    url: format!("https://example.com/{index}"),
                    title: format!("Source {index}"),
                    snippet: String::new(),
                    content: String::new(),
                    degraded: false,
                }
                .into_citation(index)
            })
            .collect();
        let entries = vec![KnowledgeEntry {
            step: 0,
            source_query: "history".into(),
            summary: "Began in 1998 [3][1].".into(),
            sources: vec![
                SourceRef {
                    citation_index: 3,
                    url: "https://example.com/3".into(),
                },
                SourceRef {
                    citation_index: 1,
                    url: "https://example.com/1".into(),
                },
            ],
            follow_up: None,
            follow_up_consumed: false,
        }];

        let kb = build_knowledge_base(&entries, &citations);

        assert!(kb.starts_with("## history\nBegan in 1998 [3][1]."));
        assert!(kb.contains("[1] Source 1 - https://example.com/1\n[3] Source 3"));
        assert!(!kb.contains("Source 2"));
    }
}
