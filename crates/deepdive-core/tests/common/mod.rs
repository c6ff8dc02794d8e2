#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deepdive_core::providers::{
    CompletionRequest, ContentFetcher, LanguageModel, ModelTask, SearchHit, SearchProvider,
};
use deepdive_core::{
    DriverSettings, DynKnowledgeStore, InMemoryKnowledgeStore, KnowledgeStore, NewSession, Providers,
    ResearchSession, StepDriver,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Notify;

static SOURCE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\[(\d+)\] ").unwrap());

/// Language model whose replies are scripted per task.
pub struct ScriptedModel {
    pub plan_reply: String,
    pub follow_ups: Mutex<VecDeque<Option<String>>>,
    pub always_follow_up: bool,
    pub always_insufficient: bool,
    pub fail_on: Option<ModelTask>,
    pub delay_on: Option<(ModelTask, Duration)>,
    /// Signals `entered` and then waits for `release` before replying to this task.
    pub gate: Option<(ModelTask, Arc<Notify>, Arc<Notify>)>,
    pub calls: Mutex<Vec<ModelTask>>,
    pub counter: AtomicUsize,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            plan_reply: "History first, then uses.\n\n1. history\n2. applications".into(),
            follow_ups: Mutex::new(VecDeque::new()),
            always_follow_up: false,
            always_insufficient: false,
            fail_on: None,
            delay_on: None,
            gate: None,
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }
}

impl ScriptedModel {
    pub fn calls_for(&self, task: ModelTask) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == task)
            .count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(request.task);

        if let Some((task, entered, release)) = &self.gate {
            if *task == request.task {
                entered.notify_one();
                release.notified().await;
            }
        }
        if let Some((task, delay)) = self.delay_on {
            if task == request.task {
                tokio::time::sleep(delay).await;
            }
        }
        if self.fail_on == Some(request.task) {
            anyhow::bail!("scripted {} failure", request.task.as_str());
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let reply = match request.task {
            ModelTask::Plan => self.plan_reply.clone(),
            ModelTask::Summarize => {
                let cites: String = SOURCE_HEADER
                    .captures_iter(&request.prompt)
                    .map(|caps| format!("[{}]", &caps[1]))
                    .collect();
                format!("Batch summary {cites}.")
            }
            ModelTask::Findings => {
                let follow_up = if self.always_follow_up {
                    Some(format!("gap {n}"))
                } else {
                    self.follow_ups.lock().unwrap().pop_front().flatten()
                };
                serde_json::json!({
                    "summary": "Merged findings [1].",
                    "needs_more_research": follow_up,
                })
                .to_string()
            }
            ModelTask::Sufficiency => {
                if self.always_insufficient {
                    serde_json::json!({
                        "sufficient": false,
                        "queries": [format!("deeper {n} a"), format!("deeper {n} b")],
                        "narrative": format!("Still missing depth (check {n})."),
                    })
                    .to_string()
                } else {
                    serde_json::json!({ "sufficient": true, "narrative": "ready to write report" })
                        .to_string()
                }
            }
            ModelTask::Report => {
                let kb = request
                    .prompt
                    .split_once("Knowledge base:\n")
                    .map(|(_, kb)| kb.to_string())
                    .unwrap_or_default();
                format!("# Report\n\n{kb}")
            }
        };
        Ok(reply)
    }
}

/// Returns `per_query` hits for every query unless an explicit list is set.
pub struct ScriptedSearch {
    pub per_query: usize,
    pub results: HashMap<String, Vec<SearchHit>>,
}

impl Default for ScriptedSearch {
    fn default() -> Self {
        Self {
            per_query: 2,
            results: HashMap::new(),
        }
    }
}

pub fn hit(url: &str, title: &str) -> SearchHit {
    SearchHit {
        url: url.into(),
        title: title.into(),
        snippet: format!("snippet for {title}"),
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(&self, query: &str, count: usize) -> anyhow::Result<Vec<SearchHit>> {
        if let Some(hits) = self.results.get(query) {
            return Ok(hits.iter().take(count).cloned().collect());
        }
        let slug = query.replace(' ', "-");
        Ok((1..=self.per_query.min(count))
            .map(|rank| hit(&format!("https://{slug}.example/{rank}"), &format!("{query} {rank}")))
            .collect())
    }
}

/// Fails for any URL listed in `failing`.
#[derive(Default)]
pub struct FlakyFetcher {
    pub failing: HashSet<String>,
}

#[async_trait]
impl ContentFetcher for FlakyFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        if self.failing.contains(url) {
            anyhow::bail!("connection reset fetching {url}");
        }
        Ok(format!("Full article text from {url}."))
    }
}

pub struct Harness {
    pub store: DynKnowledgeStore,
    pub driver: StepDriver,
    pub model: Arc<ScriptedModel>,
}

impl Harness {
    pub fn new(model: ScriptedModel, search: ScriptedSearch, fetcher: FlakyFetcher) -> Self {
        Self::with_settings(model, search, fetcher, DriverSettings::default())
    }

    pub fn with_settings(
        model: ScriptedModel,
        search: ScriptedSearch,
        fetcher: FlakyFetcher,
        settings: DriverSettings,
    ) -> Self {
        let store: DynKnowledgeStore = Arc::new(InMemoryKnowledgeStore::new());
        let model = Arc::new(model);
        let providers = Providers::new(Arc::new(search), Arc::new(fetcher), model.clone());
        let driver = StepDriver::new(store.clone(), providers, settings);
        Self {
            store,
            driver,
            model,
        }
    }

    pub fn default_harness() -> Self {
        Self::new(
            ScriptedModel::default(),
            ScriptedSearch::default(),
            FlakyFetcher::default(),
        )
    }

    pub async fn create(&self, topic: &str) -> ResearchSession {
        self.store
            .create_session(NewSession::new(topic, "u1", "m1"))
            .await
            .unwrap()
    }

    pub async fn load(&self, id: &str) -> ResearchSession {
        self.store.load_session(id).await.unwrap().unwrap()
    }
}
