//! Prompt templates for the model-backed stages.
//!
//! Every user prompt starts with a `Topic:` line so offline stubs can recover
//! the subject without a side channel.

use std::fmt::Write as _;

use crate::session::Citation;

pub const PLAN_SYSTEM: &str = "You are a research planner. Decompose the topic into focused \
sub-topics. Reply with one short rationale paragraph, a blank line, then a numbered list \
with one sub-topic per line and nothing else.";

pub const SUFFICIENCY_SYSTEM: &str = "You decide whether the gathered knowledge is enough to \
write a long-form report. Reply with a JSON object: {\"sufficient\": bool, \"queries\": \
[string, at most 10], \"narrative\": string}. The narrative briefly tells the reader what \
happens next and why.";

pub const SUMMARIZE_SYSTEM: &str = "Summarize the provided sources into one self-contained \
prose passage. Cite sources inline by their bracketed number, one number per bracket such \
as [1][2], at most three citations per sentence. Do not add a references section.";

pub const FINDINGS_SYSTEM: &str = "Merge the partial summaries into one passage, keeping every \
bracketed citation exactly as written. Reply with a JSON object: {\"summary\": string, \
\"needs_more_research\": string or null}, naming at most one specific gap worth researching.";

pub const REPORT_SYSTEM: &str = "Write a long-form, multi-section report in markdown from the \
knowledge base. Preserve bracketed citations exactly. Aim for at least 1500 words. Do not \
invent sources.";

pub fn plan_prompt(topic: &str, max_sub_topics: usize) -> String {
    format!(
        "Topic: {topic}\n\nPropose at most {max_sub_topics} sub-topics that together cover the \
         topic."
    )
}

pub fn sufficiency_prompt(topic: &str, digest: &str) -> String {
    let digest = if digest.trim().is_empty() {
        "(no prior knowledge)"
    } else {
        digest
    };
    format!("Topic: {topic}\n\nKnowledge gathered so far:\n{digest}")
}

pub fn summarize_prompt(topic: &str, sub_topic: &str, batch: &[Citation]) -> String {
    let mut prompt = format!("Topic: {topic}\nSub-topic: {sub_topic}\n\nSources:\n");
    for citation in batch {
        let _ = writeln!(
            prompt,
            "[{}] {} ({})\nQuery: {}\nSnippet: {}\nContent:\n{}\n",
            citation.index,
            citation.title,
            citation.url,
            citation.query,
            citation.snippet,
            citation.content
        );
    }
    prompt
}

pub fn findings_prompt(topic: &str, sub_topic: &str, partials: &[String]) -> String {
    let mut prompt = format!("Topic: {topic}\nSub-topic: {sub_topic}\n\nPartial summaries:\n");
    for (idx, partial) in partials.iter().enumerate() {
        let _ = writeln!(prompt, "--- part {} ---\n{}\n", idx + 1, partial.trim());
    }
    prompt
}

pub fn report_prompt(topic: &str, knowledge_base: &str) -> String {
    format!("Topic: {topic}\n\nKnowledge base:\n{knowledge_base}")
}

/// Recover the subject from the leading `Topic:` line.
pub fn topic_line(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("Topic:"))
        .map(str::trim)
}
