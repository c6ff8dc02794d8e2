//! External collaborators: web search, content fetching, and model calls.

mod extract;
mod http;
mod stub;

pub use http::{BraveSearch, ChatCompletionsModel, HttpFetcher};
pub use stub::{StubFetcher, StubLanguageModel, StubSearch};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::DeepDiveError;
use crate::config::{Config, FetchProviderKind, LlmProvider, SearchProviderKind};

/// One ranked web result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, count: usize) -> anyhow::Result<Vec<SearchHit>>;
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Readable text or markdown for `url`.
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Which stage a completion request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTask {
    Plan,
    Sufficiency,
    Summarize,
    Findings,
    Report,
}

impl ModelTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTask::Plan => "plan",
            ModelTask::Sufficiency => "sufficiency",
            ModelTask::Summarize => "summarize",
            ModelTask::Findings => "findings",
            ModelTask::Report => "report",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub task: ModelTask,
    pub model: String,
    pub system: String,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(
        task: ModelTask,
        model: impl Into<String>,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task,
            model: model.into(),
            system: system.into(),
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String>;
}

pub type DynSearchProvider = Arc<dyn SearchProvider>;
pub type DynContentFetcher = Arc<dyn ContentFetcher>;
pub type DynLanguageModel = Arc<dyn LanguageModel>;

/// The collaborators a step driver is built from.
#[derive(Clone)]
pub struct Providers {
    pub search: DynSearchProvider,
    pub fetcher: DynContentFetcher,
    pub model: DynLanguageModel,
}

impl Providers {
    pub fn new(
        search: DynSearchProvider,
        fetcher: DynContentFetcher,
        model: DynLanguageModel,
    ) -> Self {
        Self {
            search,
            fetcher,
            model,
        }
    }

    /// Deterministic offline collaborators.
    pub fn stub() -> Self {
        Self::new(
            Arc::new(StubSearch),
            Arc::new(StubFetcher),
            Arc::new(StubLanguageModel),
        )
    }

    pub fn from_config(config: &Config) -> Result<Self, DeepDiveError> {
        let search: DynSearchProvider = match config.search.provider {
            SearchProviderKind::Stub => Arc::new(StubSearch),
            SearchProviderKind::Brave => Arc::new(BraveSearch::new(
                config.search.endpoint.clone(),
                config.search_api_key()?,
            )?),
        };

        let fetcher: DynContentFetcher = match config.fetch.provider {
            FetchProviderKind::Stub => Arc::new(StubFetcher),
            FetchProviderKind::Http => Arc::new(HttpFetcher::new(
                config.fetch.reader_prefix.clone(),
                config.fetch.timeout(),
            )?),
        };

        let model: DynLanguageModel = match config.llm.provider {
            LlmProvider::Stub => Arc::new(StubLanguageModel),
            LlmProvider::OpenAi => Arc::new(ChatCompletionsModel::new(
                config.llm.base_url.clone(),
                config.llm_api_key()?,
            )?),
        };

        Ok(Self::new(search, fetcher, model))
    }
}
