//! The per-session state machine.
//!
//! Each call to [`StepDriver::advance`] claims the session, runs exactly one
//! step of its current phase under a deadline, and commits the result together
//! with the lease release. Phases run strictly in order:
//!
//! ```text
//! planning -> researching (one sub-topic per step, then convergence) -> compiling -> completed
//! ```
//!
//! Any step failure moves the session to `error`. A cancel that lands while a
//! step is in flight makes the commit a no-op, so the step's results are
//! discarded; citations recorded mid-step stay, since they are persisted as
//! they are discovered.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{Span, error, info, instrument, warn};

use crate::config::{Config, ConvergenceStrategy};
use crate::error::{DriverError, StepError, StoreError};
use crate::journal::SessionJournal;
use crate::metrics;
use crate::planner::Planner;
use crate::providers::Providers;
use crate::report::{ReportCompiler, build_knowledge_base};
use crate::research::{GatherSettings, SourceGatherer};
use crate::session::{KnowledgeEntry, Phase, ResearchSession, SessionStatus, SubTopic};
use crate::store::{Claim, CommitOutcome, DynKnowledgeStore, Rejection};
use crate::summarizer::Summarizer;

/// Limits and knobs for the state machine.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Research passes allowed, counting the initial plan as the first.
    pub max_rounds: u32,
    pub max_sub_topics: usize,
    pub max_plan_entries: usize,
    pub summary_batch_size: usize,
    pub step_timeout: Duration,
    pub lease_ttl: Duration,
    pub convergence: ConvergenceStrategy,
    pub gather: GatherSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        let research = &config.research;
        Self {
            max_rounds: research.max_rounds,
            max_sub_topics: research.max_sub_topics,
            max_plan_entries: research.max_plan_entries,
            summary_batch_size: research.summary_batch_size,
            step_timeout: research.step_timeout(),
            lease_ttl: research.lease_ttl(),
            convergence: research.convergence,
            gather: GatherSettings {
                results_per_query: config.search.results_per_query,
                fetch_timeout: config.fetch.timeout(),
                max_concurrency: config.fetch.max_concurrency,
            },
        }
    }

    /// Upper bound on the number of steps a session can take before it is
    /// terminal: one planning step, one per plan entry, one convergence check
    /// per round, and the compile step.
    pub fn max_steps(&self) -> usize {
        1 + self.max_plan_entries + self.max_rounds as usize + 1
    }
}

/// Why an `advance` call did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another execution holds the processing lease.
    Busy,
    /// The session already reached this terminal status.
    Terminal(SessionStatus),
    /// The step ran but its commit was refused.
    Discarded(Rejection),
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Busy => "busy",
            SkipReason::Terminal(_) => "terminal",
            SkipReason::Discarded(Rejection::LeaseLost) => "lease_lost",
            SkipReason::Discarded(Rejection::NotPending(_)) => "canceled_mid_step",
        }
    }
}

/// Result of one `advance` invocation. `Continue` asks the caller to schedule
/// another invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Continue,
    Completed,
    Failed { message: String },
    Skipped(SkipReason),
}

impl AdvanceOutcome {
    pub fn should_continue(&self) -> bool {
        matches!(self, AdvanceOutcome::Continue)
    }
}

#[derive(Clone)]
pub struct StepDriver {
    store: DynKnowledgeStore,
    planner: Planner,
    summarizer: Summarizer,
    compiler: ReportCompiler,
    gatherer: SourceGatherer,
    settings: DriverSettings,
    journal: Option<SessionJournal>,
}

impl StepDriver {
    pub fn new(store: DynKnowledgeStore, providers: Providers, settings: DriverSettings) -> Self {
        let gatherer = SourceGatherer::new(
            store.clone(),
            providers.search,
            providers.fetcher,
            settings.gather.clone(),
        );
        Self {
            planner: Planner::new(providers.model.clone()),
            summarizer: Summarizer::new(providers.model.clone()),
            compiler: ReportCompiler::new(providers.model),
            gatherer,
            store,
            settings,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Option<SessionJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn store(&self) -> &DynKnowledgeStore {
        &self.store
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Run one step for `session_id`.
    ///
    /// Concurrent calls for the same session are safe: only the caller that
    /// wins the claim does work, the others return `Skipped(Busy)`.
    #[instrument(name = "driver.advance", skip(self), fields(phase = tracing::field::Empty))]
    pub async fn advance(&self, session_id: &str) -> Result<AdvanceOutcome, DriverError> {
        let session = match self
            .store
            .try_claim(session_id, self.settings.lease_ttl)
            .await?
        {
            Claim::Acquired(session) => session,
            Claim::Busy => return Ok(self.skipped(SkipReason::Busy)),
            Claim::Inactive(status) => return Ok(self.skipped(SkipReason::Terminal(status))),
            Claim::NotFound => return Err(DriverError::NotFound(session_id.to_string())),
        };
        let Some(token) = session.lease.as_ref().map(|lease| lease.token.clone()) else {
            return Err(StoreError::Backend(format!(
                "claim on {session_id} returned without a lease"
            ))
            .into());
        };

        let phase = session.phase;
        Span::current().record("phase", phase.as_str());
        info!(session_id, %phase, "step started");

        let started = Instant::now();
        let deadline = self.settings.step_timeout;
        let result = tokio::time::timeout(deadline, self.run_step(session))
            .await
            .unwrap_or(Err(StepError::Timeout {
                phase,
                after: deadline,
            }));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(updated) => self.commit(updated, &token, phase, elapsed_ms).await,
            Err(err) => self.fail(session_id, &token, phase, err, elapsed_ms).await,
        }
    }

    fn skipped(&self, reason: SkipReason) -> AdvanceOutcome {
        metrics::record_noop(reason.as_str());
        info!(reason = reason.as_str(), "advance skipped");
        AdvanceOutcome::Skipped(reason)
    }

    async fn commit(
        &self,
        updated: ResearchSession,
        token: &str,
        phase: Phase,
        elapsed_ms: u64,
    ) -> Result<AdvanceOutcome, DriverError> {
        let outcome = match self.store.commit_step(&updated, token).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Release the lease so the session does not sit claimed until expiry.
                error!(session_id = %updated.id, error = %err, "commit failed");
                if let Err(release) = self
                    .store
                    .fail_session(&updated.id, token, &err.to_string())
                    .await
                {
                    warn!(session_id = %updated.id, error = %release, "could not record commit failure");
                }
                metrics::record_step(phase, "store_error", elapsed_ms);
                return Err(err.into());
            }
        };

        match outcome {
            CommitOutcome::Committed => {
                metrics::record_step(phase, "committed", elapsed_ms);
                info!(
                    session_id = %updated.id,
                    next_phase = %updated.phase,
                    cursor = updated.sub_topic_cursor,
                    plan_len = updated.plan.len(),
                    elapsed_ms,
                    "step committed"
                );
                if updated.status == SessionStatus::Completed {
                    self.write_journal(&updated).await;
                    Ok(AdvanceOutcome::Completed)
                } else {
                    Ok(AdvanceOutcome::Continue)
                }
            }
            CommitOutcome::Rejected(rejection) => {
                metrics::record_step(phase, "discarded", elapsed_ms);
                warn!(session_id = %updated.id, ?rejection, "step result discarded");
                Ok(self.skipped(SkipReason::Discarded(rejection)))
            }
        }
    }

    async fn fail(
        &self,
        session_id: &str,
        token: &str,
        phase: Phase,
        err: StepError,
        elapsed_ms: u64,
    ) -> Result<AdvanceOutcome, DriverError> {
        let message = err.to_string();
        error!(session_id, %phase, error = %message, "step failed");

        match self.store.fail_session(session_id, token, &message).await? {
            CommitOutcome::Committed => {
                metrics::record_step(phase, "failed", elapsed_ms);
                if let Some(session) = self.store.load_session(session_id).await? {
                    self.write_journal(&session).await;
                }
                Ok(AdvanceOutcome::Failed { message })
            }
            CommitOutcome::Rejected(rejection) => {
                metrics::record_step(phase, "discarded", elapsed_ms);
                Ok(self.skipped(SkipReason::Discarded(rejection)))
            }
        }
    }

    async fn write_journal(&self, session: &ResearchSession) {
        let Some(journal) = &self.journal else {
            return;
        };
        let urls = match self.store.citations(&session.id).await {
            Ok(citations) => citations.into_iter().map(|citation| citation.url).collect(),
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "could not load citations for journal");
                Vec::new()
            }
        };
        let journal = journal.clone();
        let snapshot = session.clone();
        let written = tokio::task::spawn_blocking(move || journal.record(&snapshot, &urls)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id = %session.id, error = %err, "failed to write session journal");
            }
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "session journal task aborted");
            }
        }
    }

    async fn run_step(&self, session: ResearchSession) -> Result<ResearchSession, StepError> {
        match session.phase {
            Phase::Planning => self.plan(session).await,
            Phase::Researching if session.current_sub_topic().is_some() => {
                self.research_next(session).await
            }
            Phase::Researching => self.converge(session).await,
            Phase::Compiling => self.compile(session).await,
        }
    }

    #[instrument(name = "driver.plan", skip_all, fields(session_id = %session.id))]
    async fn plan(&self, mut session: ResearchSession) -> Result<ResearchSession, StepError> {
        let plan = self
            .planner
            .generate_plan(&session.topic, &session.model, self.settings.max_sub_topics)
            .await?;

        if !plan.rationale.is_empty() {
            session.record_progress(plan.rationale.clone());
            session.plan_rationale = Some(plan.rationale);
        }
        session.record_progress(format!(
            "Planned {} sub-topics: {}",
            plan.sub_topics.len(),
            plan.sub_topics.join("; ")
        ));

        session.plan = plan
            .sub_topics
            .into_iter()
            .map(|query| SubTopic::new(query, 1))
            .collect();
        session.sub_topic_cursor = 0;
        session.research_round = 1;
        session.phase = Phase::Researching;
        Ok(session)
    }

    #[instrument(name = "driver.research", skip_all, fields(session_id = %session.id, cursor = session.sub_topic_cursor))]
    async fn research_next(&self, mut session: ResearchSession) -> Result<ResearchSession, StepError> {
        let position = session.sub_topic_cursor;
        let query = session.plan[position].query.clone();
        let citations = self.gatherer.gather(&session.id, &query).await?;

        let entry = if citations.is_empty() {
            session.record_progress(format!("No sources found for \"{query}\""));
            KnowledgeEntry {
                step: position,
                source_query: query.clone(),
                summary: format!("No search results were found for \"{query}\"."),
                sources: Vec::new(),
                follow_up: None,
                follow_up_consumed: false,
            }
        } else {
            let mut partials = Vec::new();
            let mut sources = Vec::new();
            for batch in citations.chunks(self.settings.summary_batch_size.max(1)) {
                let summary = self
                    .summarizer
                    .summarize(&session.topic, &query, batch, &session.model)
                    .await?;
                partials.push(summary.summary_text);
                sources.extend(summary.sources);
            }

            let (summary, follow_up) = match self.settings.convergence {
                ConvergenceStrategy::FollowUp => {
                    let allowed: HashSet<u32> =
                        citations.iter().map(|citation| citation.index).collect();
                    let findings = self
                        .summarizer
                        .summarize_findings(
                            &session.topic,
                            &query,
                            &partials,
                            &allowed,
                            &session.model,
                        )
                        .await?;
                    (findings.summary, findings.needs_more_research)
                }
                ConvergenceStrategy::Sufficiency => (partials.join("\n\n"), None),
            };

            let degraded = citations.iter().filter(|citation| citation.degraded).count();
            session.record_progress(format!(
                "Researched \"{query}\" using {} sources ({degraded} from snippets)",
                citations.len()
            ));
            KnowledgeEntry {
                step: position,
                source_query: query,
                summary,
                sources,
                follow_up,
                follow_up_consumed: false,
            }
        };

        session.knowledge.push(entry);
        session.sub_topic_cursor += 1;
        Ok(session)
    }

    /// End of a research pass: extend the plan or move on to compiling.
    #[instrument(name = "driver.converge", skip_all, fields(session_id = %session.id, round = session.research_round))]
    async fn converge(&self, mut session: ResearchSession) -> Result<ResearchSession, StepError> {
        if session.research_round >= self.settings.max_rounds {
            session.record_progress(format!(
                "Reached the limit of {} research rounds; compiling the report",
                self.settings.max_rounds
            ));
            session.phase = Phase::Compiling;
            return Ok(session);
        }

        let candidates = match self.settings.convergence {
            ConvergenceStrategy::FollowUp => {
                let mut gaps = Vec::new();
                for entry in &mut session.knowledge {
                    if let Some(gap) = entry.pending_follow_up() {
                        gaps.push(gap.to_string());
                    }
                    entry.follow_up_consumed = true;
                }
                gaps
            }
            ConvergenceStrategy::Sufficiency => {
                let verdict = self
                    .planner
                    .evaluate_sufficiency(
                        &session.topic,
                        &session.knowledge_digest(),
                        &session.model,
                    )
                    .await?;
                session.record_progress(verdict.narrative);
                if verdict.sufficient {
                    Vec::new()
                } else {
                    verdict.queries
                }
            }
        };

        let mut known: HashSet<String> = session
            .plan
            .iter()
            .map(|entry| entry.query.to_lowercase())
            .collect();
        let room = self
            .settings
            .max_plan_entries
            .saturating_sub(session.plan.len());
        let additions: Vec<String> = candidates
            .iter()
            .filter(|query| known.insert(query.to_lowercase()))
            .take(room)
            .cloned()
            .collect();

        if additions.is_empty() {
            let reason = if !candidates.is_empty() && room == 0 {
                format!(
                    "Plan limit of {} sub-topics reached; compiling the report",
                    self.settings.max_plan_entries
                )
            } else {
                "No further research needed; compiling the report".to_string()
            };
            session.record_progress(reason);
            session.phase = Phase::Compiling;
            return Ok(session);
        }

        session.research_round += 1;
        let round = session.research_round;
        session.record_progress(format!(
            "Round {round}: researching {} more sub-topics: {}",
            additions.len(),
            additions.join("; ")
        ));
        // The cursor already points at the first appended entry.
        session
            .plan
            .extend(additions.into_iter().map(|query| SubTopic::new(query, round)));
        Ok(session)
    }

    #[instrument(name = "driver.compile", skip_all, fields(session_id = %session.id))]
    async fn compile(&self, mut session: ResearchSession) -> Result<ResearchSession, StepError> {
        let citations = self.store.citations(&session.id).await?;
        let knowledge_base = build_knowledge_base(&session.knowledge, &citations);
        let report = self
            .compiler
            .compile(&session.topic, &knowledge_base, &session.model)
            .await?;

        session.record_progress(format!(
            "Compiled the final report from {} knowledge entries",
            session.knowledge.len()
        ));
        session.complete(report);
        Ok(session)
    }
}
