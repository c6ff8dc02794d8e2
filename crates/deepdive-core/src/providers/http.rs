use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::extract::{html_to_text, looks_like_html};
use super::{CompletionRequest, ContentFetcher, LanguageModel, SearchHit, SearchProvider};
use crate::{DeepDiveError, SecretValue};

fn build_client(timeout: Option<Duration>) -> Result<Client, DeepDiveError> {
    let mut builder = Client::builder().user_agent(concat!("deepdive/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|err| DeepDiveError::InvalidConfiguration(format!("http client: {err}")))
}

/// Brave web search API.
pub struct BraveSearch {
    client: Client,
    endpoint: String,
    api_key: SecretValue,
}

impl BraveSearch {
    pub fn new(endpoint: impl Into<String>, api_key: SecretValue) -> Result<Self, DeepDiveError> {
        Ok(Self {
            client: build_client(None)?,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Deserialize)]
struct BraveResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

#[async_trait]
impl SearchProvider for BraveSearch {
    async fn search(&self, query: &str, count: usize) -> anyhow::Result<Vec<SearchHit>> {
        let count = count.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("count", count.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", self.api_key.expose())
            .send()
            .await
            .context("search request failed")?
            .error_for_status()
            .context("search provider returned an error status")?;

        let body: BraveResponse = response
            .json()
            .await
            .context("search response was not valid JSON")?;

        let hits = body
            .web
            .map(|web| web.results)
            .unwrap_or_default()
            .into_iter()
            .map(|result| SearchHit {
                url: result.url,
                title: result.title,
                snippet: result.description,
            })
            .collect::<Vec<_>>();

        debug!(%query, hits = hits.len(), "search completed");
        Ok(hits)
    }
}

/// Fetches page text directly, or through a reader service when a prefix is set.
///
/// Without a reader, HTML responses are reduced to their readable text.
pub struct HttpFetcher {
    client: Client,
    reader_prefix: Option<String>,
}

impl HttpFetcher {
    pub fn new(reader_prefix: Option<String>, timeout: Duration) -> Result<Self, DeepDiveError> {
        Ok(Self {
            client: build_client(Some(timeout))?,
            reader_prefix,
        })
    }

    fn target(&self, url: &str) -> String {
        match &self.reader_prefix {
            Some(prefix) => format!("{prefix}{url}"),
            None => url.to_string(),
        }
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .get(self.target(url))
            .send()
            .await
            .with_context(|| format!("fetch of {url} failed"))?
            .error_for_status()
            .with_context(|| format!("fetch of {url} returned an error status"))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let mut body = response.text().await?;
        if self.reader_prefix.is_none() && looks_like_html(content_type.as_deref(), &body) {
            body = html_to_text(&body);
        }
        if body.trim().is_empty() {
            bail!("fetch of {url} returned no readable text");
        }
        Ok(body)
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsModel {
    client: Client,
    base_url: String,
    api_key: SecretValue,
}

impl ChatCompletionsModel {
    pub fn new(base_url: impl Into<String>, api_key: SecretValue) -> Result<Self, DeepDiveError> {
        Ok(Self {
            client: build_client(None)?,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = ChatRequest {
            model: &request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
        };

        let response: ChatResponse = self
            .client
            .post(url)
            .bearer_auth(self.api_key.expose())
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("{} completion request failed", request.task.as_str()))?
            .error_for_status()?
            .json()
            .await
            .context("completion response was not valid JSON")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow!("completion response contained no content"))
    }
}
