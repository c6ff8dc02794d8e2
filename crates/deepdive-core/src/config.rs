use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{DeepDiveError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "deepdive.toml";
const CONFIG_PATH_ENV: &str = "DEEPDIVE_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub fetch: FetchConfig,
    pub research: ResearchConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, DeepDiveError> {
        require_env(&self.llm.api_key_env)
    }

    pub fn search_api_key(&self) -> Result<SecretValue, DeepDiveError> {
        require_env(&self.search.api_key_env)
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPDIVE_CONFIG` environment variable.
    /// 3. `deepdive.toml` in the current working directory.
    /// 4. Built-in defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Config, DeepDiveError> {
        let config = match resolve_path(path) {
            Some(candidate) => {
                let raw = fs::read_to_string(&candidate)
                    .map_err(|err| DeepDiveError::config_io(candidate.clone(), err))?;
                Self::parse(&raw)?
            }
            None => Config::default(),
        };

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Config, DeepDiveError> {
        toml::from_str(raw).map_err(|err| DeepDiveError::InvalidConfiguration(err.to_string()))
    }

    pub fn validate(config: &Config) -> Result<(), DeepDiveError> {
        let research = &config.research;
        if research.max_rounds == 0 {
            return Err(invalid("research.max_rounds must be at least 1"));
        }
        if research.max_sub_topics == 0 {
            return Err(invalid("research.max_sub_topics must be at least 1"));
        }
        if research.max_plan_entries < research.max_sub_topics {
            return Err(invalid(
                "research.max_plan_entries must be >= research.max_sub_topics",
            ));
        }
        if research.summary_batch_size == 0 {
            return Err(invalid("research.summary_batch_size must be at least 1"));
        }
        if research.step_timeout_ms == 0 {
            return Err(invalid("research.step_timeout_ms must be positive"));
        }
        // A lease that can expire while its step is still inside the deadline
        // would let a second execution take the session over mid-step.
        let min_lease = research.step_timeout_ms.saturating_add(LEASE_COMMIT_MARGIN_MS);
        if research.lease_ttl_ms.is_some_and(|ttl| ttl < min_lease) {
            return Err(DeepDiveError::InvalidConfiguration(format!(
                "research.lease_ttl_ms must be at least step_timeout_ms + {LEASE_COMMIT_MARGIN_MS} ({min_lease})"
            )));
        }
        if config.search.results_per_query == 0 {
            return Err(invalid("search.results_per_query must be at least 1"));
        }
        if config.fetch.max_concurrency == 0 {
            return Err(invalid("fetch.max_concurrency must be at least 1"));
        }

        // Secrets are referenced by variable name only; make sure they resolve
        // for the providers that need them.
        if config.llm.provider == LlmProvider::OpenAi {
            if config.llm.api_key_env.trim().is_empty() {
                return Err(invalid(
                    "llm.api_key_env must reference an environment variable",
                ));
            }
            require_env(&config.llm.api_key_env)?;
        }
        if config.search.provider == SearchProviderKind::Brave {
            require_env(&config.search.api_key_env)?;
        }
        #[cfg(not(feature = "postgres-store"))]
        if config.store.backend == StoreBackend::Postgres {
            return Err(invalid(
                "store.backend = \"postgres\" requires the postgres-store feature",
            ));
        }
        if config.store.backend == StoreBackend::Postgres && config.store.url.is_none() {
            return Err(invalid("store.url is required for the postgres backend"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> DeepDiveError {
    DeepDiveError::InvalidConfiguration(message.to_string())
}

fn resolve_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(path);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return Some(PathBuf::from(from_env));
        }
    }

    let default = Path::new(DEFAULT_CONFIG_PATH);
    default.exists().then(|| default.to_path_buf())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Stub,
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub base_url: String,
    /// Model used when a session does not name one.
    pub model: String,
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Stub,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    #[default]
    Stub,
    Brave,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: SearchProviderKind,
    pub endpoint: String,
    pub api_key_env: String,
    pub results_per_query: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: SearchProviderKind::Stub,
            endpoint: "https://api.search.brave.com/res/v1/web/search".to_string(),
            api_key_env: "BRAVE_API_KEY".to_string(),
            results_per_query: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchProviderKind {
    #[default]
    Stub,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub provider: FetchProviderKind,
    /// Optional reader service prefixed to each URL (e.g. `https://r.jina.ai/`).
    pub reader_prefix: Option<String>,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            provider: FetchProviderKind::Stub,
            reader_prefix: None,
            timeout_ms: 15_000,
            max_concurrency: 10,
        }
    }
}

/// How the driver decides whether another research pass is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStrategy {
    /// Fold "needs more research" signals from knowledge entries into the plan.
    #[default]
    FollowUp,
    /// Ask the planner whether accumulated knowledge is sufficient.
    Sufficiency,
}

/// Time a lease must outlive the step deadline, leaving room to commit.
pub const LEASE_COMMIT_MARGIN_MS: u64 = 5_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_rounds: u32,
    pub max_sub_topics: usize,
    pub max_plan_entries: usize,
    pub summary_batch_size: usize,
    pub step_timeout_ms: u64,
    /// Age after which a processing lease may be taken over. Must cover the
    /// step deadline plus [`LEASE_COMMIT_MARGIN_MS`]; defaults to twice the
    /// deadline, or the deadline plus the margin when that is longer.
    pub lease_ttl_ms: Option<u64>,
    pub convergence: ConvergenceStrategy,
}

impl ResearchConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms.unwrap_or_else(|| {
            self.step_timeout_ms
                .saturating_add(self.step_timeout_ms.max(LEASE_COMMIT_MARGIN_MS))
        }))
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            max_sub_topics: 10,
            max_plan_entries: 20,
            summary_batch_size: 3,
            step_timeout_ms: 300_000,
            lease_ttl_ms: None,
            convergence: ConvergenceStrategy::FollowUp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for the session journal; disabled when unset.
    pub journal_dir: Option<PathBuf>,
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            journal_dir: None,
            retention_days: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ConfigLoader::parse("").expect("empty config parses");
        assert_eq!(config.research.max_rounds, 5);
        assert_eq!(config.research.summary_batch_size, 3);
        assert_eq!(config.search.results_per_query, 10);
        assert_eq!(config.research.lease_ttl(), Duration::from_millis(600_000));
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = ConfigLoader::parse(
            r#"
            [research]
            max_rounds = 2
            convergence = "sufficiency"

            [fetch]
            reader_prefix = "https://r.jina.ai/"
            "#,
        )
        .expect("config parses");

        assert_eq!(config.research.max_rounds, 2);
        assert_eq!(config.research.max_plan_entries, 20);
        assert_eq!(
            config.research.convergence,
            ConvergenceStrategy::Sufficiency
        );
        assert_eq!(
            config.fetch.reader_prefix.as_deref(),
            Some("https://r.jina.ai/")
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = ConfigLoader::parse("[research]\nsummary_batch_size = 0\n").unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(matches!(err, DeepDiveError::InvalidConfiguration(_)));
    }

    #[test]
    fn lease_shorter_than_step_deadline_is_rejected() {
        let config =
            ConfigLoader::parse("[research]\nstep_timeout_ms = 300000\nlease_ttl_ms = 1\n").unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(matches!(err, DeepDiveError::InvalidConfiguration(ref msg) if msg.contains("lease_ttl_ms")));

        let config = ConfigLoader::parse(
            "[research]\nstep_timeout_ms = 300000\nlease_ttl_ms = 302000\n",
        )
        .unwrap();
        assert!(ConfigLoader::validate(&config).is_err());

        let config = ConfigLoader::parse(
            "[research]\nstep_timeout_ms = 300000\nlease_ttl_ms = 305000\n",
        )
        .unwrap();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn default_lease_outlives_short_deadlines() {
        let config = ConfigLoader::parse("[research]\nstep_timeout_ms = 1000\n").unwrap();
        assert_eq!(config.research.lease_ttl(), Duration::from_millis(6_000));
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn openai_provider_requires_secret() {
        let config = ConfigLoader::parse(
            "[llm]\nprovider = \"openai\"\napi_key_env = \"DEEPDIVE_TEST_UNSET_KEY\"\n",
        )
        .unwrap();
        unsafe {
            std::env::remove_var("DEEPDIVE_TEST_UNSET_KEY");
        }
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(matches!(err, DeepDiveError::MissingSecret(_)));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = ConfigLoader::load(Some(PathBuf::from("/nonexistent/deepdive.toml")))
            .unwrap_err();
        assert!(matches!(err, DeepDiveError::ConfigIo { .. }));
    }
}
