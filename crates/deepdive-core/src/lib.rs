//! DeepDive core: resumable, multi-step research sessions.
//!
//! A session moves through planning, iterative research, and report
//! compilation one [`StepDriver::advance`] at a time. All collaborators (the
//! Knowledge Store, search, content fetching, and the language model) are
//! injected, so every piece can be replaced with an in-memory fake.

pub mod config;
mod driver;
mod error;
mod journal;
pub mod metrics;
mod planner;
pub mod progress;
pub mod prompts;
pub mod providers;
mod report;
mod research;
mod scheduler;
mod security;
mod service;
mod session;
pub mod store;
mod summarizer;
pub mod telemetry;
mod worker;

pub use config::{Config, ConfigLoader, ConvergenceStrategy};
pub use driver::{AdvanceOutcome, DriverSettings, SkipReason, StepDriver};
pub use error::{DeepDiveError, DriverError, StepError, StoreError};
pub use journal::SessionJournal;
pub use planner::{MAX_FOLLOW_UP_QUERIES, Planner, ResearchPlan, SufficiencyVerdict, parse_plan};
pub use progress::{ProgressEntry, ProgressSummary};
pub use providers::Providers;
pub use report::{ReportCompiler, build_knowledge_base};
pub use research::{GatherSettings, SourceGatherer};
pub use scheduler::{
    DynScheduler, QueueScheduler, ScheduleError, Scheduler, SpawnScheduler, run_queue_worker,
};
pub use security::{SecretValue, require_env};
pub use service::{ResearchService, SessionView};
pub use session::{
    Citation, KnowledgeEntry, NewCitation, NewSession, Phase, ProcessingLease, ResearchSession,
    SessionStatus, SourceRef, SubTopic,
};
pub use store::{
    Claim, CommitOutcome, DynKnowledgeStore, InMemoryKnowledgeStore, KnowledgeStore, Rejection,
};
pub use summarizer::{
    BatchSummary, Findings, MAX_CITATIONS_PER_CLAIM, Summarizer, sanitize_citations,
};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use worker::{run_to_completion, run_to_completion_with};

/// Build the configured Knowledge Store backend.
pub async fn open_store(config: &Config) -> Result<DynKnowledgeStore, DeepDiveError> {
    match config.store.backend {
        config::StoreBackend::Memory => Ok(std::sync::Arc::new(InMemoryKnowledgeStore::new())),
        #[cfg(feature = "postgres-store")]
        config::StoreBackend::Postgres => {
            let url = config.store.url.as_deref().ok_or_else(|| {
                DeepDiveError::InvalidConfiguration("store.url is required".into())
            })?;
            Ok(std::sync::Arc::new(
                store::PostgresKnowledgeStore::connect(url).await?,
            ))
        }
        #[cfg(not(feature = "postgres-store"))]
        config::StoreBackend::Postgres => Err(DeepDiveError::InvalidConfiguration(
            "store.backend = \"postgres\" requires the postgres-store feature".into(),
        )),
    }
}

/// Wire a driver from configuration: providers, limits, and the journal.
pub async fn build_driver(config: &Config) -> Result<StepDriver, DeepDiveError> {
    let store = open_store(config).await?;
    let providers = Providers::from_config(config)?;
    Ok(
        StepDriver::new(store, providers, DriverSettings::from_config(config))
            .with_journal(SessionJournal::from_config(&config.logging)),
    )
}
