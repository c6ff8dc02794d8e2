//! Search and fetch for one sub-topic.

use std::collections::HashSet;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, instrument, warn};

use crate::error::StepError;
use crate::metrics;
use crate::providers::{DynContentFetcher, DynSearchProvider, SearchHit};
use crate::session::{Citation, NewCitation};
use crate::store::DynKnowledgeStore;

#[derive(Debug, Clone)]
pub struct GatherSettings {
    pub results_per_query: usize,
    pub fetch_timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for GatherSettings {
    fn default() -> Self {
        Self {
            results_per_query: 10,
            fetch_timeout: Duration::from_secs(15),
            max_concurrency: 10,
        }
    }
}

/// Turns a query into persisted citations.
#[derive(Clone)]
pub struct SourceGatherer {
    store: DynKnowledgeStore,
    search: DynSearchProvider,
    fetcher: DynContentFetcher,
    settings: GatherSettings,
}

impl SourceGatherer {
    pub fn new(
        store: DynKnowledgeStore,
        search: DynSearchProvider,
        fetcher: DynContentFetcher,
        settings: GatherSettings,
    ) -> Self {
        Self {
            store,
            search,
            fetcher,
            settings,
        }
    }

    /// Search for `query`, fetch every hit, and record one citation per hit.
    ///
    /// Fetches run concurrently but citations are recorded in search-rank order
    /// as each result becomes available. A failed, empty, or timed-out fetch
    /// records the search snippet instead and marks the citation degraded.
    #[instrument(name = "research.gather", skip(self))]
    pub async fn gather(&self, session_id: &str, query: &str) -> Result<Vec<Citation>, StepError> {
        let hits = self
            .search
            .search(query, self.settings.results_per_query)
            .await
            .map_err(|source| StepError::Search {
                query: query.to_string(),
                source,
            })?;

        let mut seen = HashSet::new();
        let hits: Vec<SearchHit> = hits
            .into_iter()
            .filter(|hit| !hit.url.trim().is_empty() && seen.insert(hit.url.clone()))
            .take(self.settings.results_per_query)
            .collect();
        debug!(hits = hits.len(), "search returned");

        let fetcher = &self.fetcher;
        let timeout = self.settings.fetch_timeout;
        let mut fetched = stream::iter(hits)
            .map(|hit| async move {
                let result = tokio::time::timeout(timeout, fetcher.fetch(&hit.url)).await;
                (hit, result)
            })
            .buffered(self.settings.max_concurrency.max(1));

        let mut citations = Vec::new();
        while let Some((hit, result)) = fetched.next().await {
            let content = match result {
                Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
                Ok(Ok(_)) => {
                    warn!(url = %hit.url, "fetched page was empty; using snippet");
                    None
                }
                Ok(Err(err)) => {
                    warn!(url = %hit.url, error = %err, "fetch failed; using snippet");
                    None
                }
                Err(_) => {
                    warn!(url = %hit.url, timeout_ms = timeout.as_millis() as u64, "fetch timed out; using snippet");
                    None
                }
            };
            let degraded = content.is_none();
            if degraded {
                metrics::record_fetch_fallback();
            }

            let title = if hit.title.trim().is_empty() {
                hit.url.clone()
            } else {
                hit.title
            };
            let citation = self
                .store
                .record_citation(
                    session_id,
                    NewCitation {
                        query: query.to_string(),
                        content: content.unwrap_or_else(|| hit.snippet.clone()),
                        url: hit.url,
                        title,
                        snippet: hit.snippet,
                        degraded,
                    },
                )
                .await?;
            debug!(citation_index = citation.index, degraded, "citation recorded");
            citations.push(citation);
        }

        Ok(citations)
    }
}
