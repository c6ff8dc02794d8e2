use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deepdive_core::config::{FetchProviderKind, LlmProvider, SearchProviderKind};
use deepdive_core::{
    Config, ConfigLoader, ConvergenceStrategy, ProgressSummary, ResearchService, ResearchSession,
    SessionStatus, SessionView, StepDriver, TelemetryOptions, build_driver, init_telemetry,
    run_to_completion_with,
};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "deepdive", version, about = "Resumable multi-step research sessions")]
struct Cli {
    /// Path to a deepdive.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive (overrides RUST_LOG).
    #[arg(long, global = true, default_value = "warn,deepdive_core=info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a session and drive it until it finishes.
    Run(RunArgs),
    /// Continue an existing session from its last committed step.
    Resume(ResumeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Topic to research.
    #[arg(long)]
    topic: String,

    /// Model to use instead of the configured default.
    #[arg(long)]
    model: Option<String>,

    /// Owner recorded on the session.
    #[arg(long, default_value = "local")]
    user: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    /// Session ID to resume (requires a persistent store).
    #[arg(long)]
    session: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug, Default)]
struct Overrides {
    /// Use offline stub providers for search, fetching, and the model.
    #[arg(long)]
    offline: bool,

    #[arg(long)]
    max_rounds: Option<u32>,

    #[arg(long, value_enum)]
    convergence: Option<ConvergenceArg>,
}

#[derive(Args, Debug, Default)]
struct OutputArgs {
    /// Print the numbered progress log after the report.
    #[arg(long, value_enum)]
    explain: Option<ExplainFormat>,

    /// Print the final session as JSON instead of the report text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConvergenceArg {
    FollowUp,
    Sufficiency,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExplainFormat {
    Markdown,
    Mermaid,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(TelemetryOptions {
        env_filter: Some(cli.log.clone()),
        ..TelemetryOptions::default()
    })?;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(cli.config, args).await,
            Command::Resume(args) => resume_command(cli.config, args).await,
        }
    })
}

async fn run_command(config_path: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let config = load_config(config_path, &args.overrides)?;
    let driver = build_driver(&config).await?;
    let service = ResearchService::new(driver.clone(), config.llm.model.clone());

    let session = service
        .create(&args.topic, &args.user, args.model.as_deref())
        .await?;
    info!(session_id = %session.id, topic = %session.topic, "starting research session");
    eprintln!("session {}", session.id);

    let session = drive(&driver, &session.id).await?;
    print_outcome(&session, &args.output)
}

async fn resume_command(config_path: Option<PathBuf>, args: ResumeArgs) -> Result<()> {
    let config = load_config(config_path, &args.overrides)?;
    let driver = build_driver(&config).await?;
    info!(session_id = %args.session, "resuming research session");

    let session = drive(&driver, &args.session).await?;
    print_outcome(&session, &args.output)
}

fn load_config(path: Option<PathBuf>, overrides: &Overrides) -> Result<Config> {
    let mut config = ConfigLoader::load(path)?;
    apply_overrides(&mut config, overrides);
    ConfigLoader::validate(&config)?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, overrides: &Overrides) {
    if overrides.offline {
        config.llm.provider = LlmProvider::Stub;
        config.search.provider = SearchProviderKind::Stub;
        config.fetch.provider = FetchProviderKind::Stub;
    }
    if let Some(max_rounds) = overrides.max_rounds {
        config.research.max_rounds = max_rounds;
    }
    if let Some(convergence) = overrides.convergence {
        config.research.convergence = match convergence {
            ConvergenceArg::FollowUp => ConvergenceStrategy::FollowUp,
            ConvergenceArg::Sufficiency => ConvergenceStrategy::Sufficiency,
        };
    }
}

/// Drive the session to a terminal state, echoing new progress lines to stderr.
async fn drive(driver: &StepDriver, session_id: &str) -> Result<ResearchSession> {
    let mut printed = 0;
    let session = run_to_completion_with(driver, session_id, |session| {
        for entry in session.progress.iter().skip(printed) {
            eprintln!("[{}] {}", entry.phase.as_str(), entry.message);
        }
        printed = session.progress.len();
    })
    .await?;
    for entry in session.progress.iter().skip(printed) {
        eprintln!("[{}] {}", entry.phase.as_str(), entry.message);
    }
    Ok(session)
}

fn print_outcome(session: &ResearchSession, output: &OutputArgs) -> Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(&SessionView::from(session))?);
    } else if let Some(report) = &session.final_report {
        println!("{report}");
    }

    if let Some(format) = output.explain {
        let summary = ProgressSummary::from_entries(&session.progress);
        let rendered = match format {
            ExplainFormat::Markdown => summary.render_markdown(),
            ExplainFormat::Mermaid => summary.render_mermaid(),
        };
        println!("\n{rendered}");
    }

    match session.status {
        SessionStatus::Completed => Ok(()),
        SessionStatus::Error => bail!(
            "session {} failed: {}",
            session.id,
            session.error_message.as_deref().unwrap_or("unknown error")
        ),
        status => bail!("session {} ended as {status}", session.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_arguments_parse_with_overrides() {
        let cli = Cli::try_parse_from([
            "deepdive",
            "run",
            "--topic",
            "soil carbon",
            "--offline",
            "--max-rounds",
            "2",
            "--convergence",
            "sufficiency",
            "--explain",
            "mermaid",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.topic, "soil carbon");
        assert_eq!(args.user, "local");
        assert!(args.overrides.offline);
        assert_eq!(args.overrides.max_rounds, Some(2));
        assert!(matches!(args.output.explain, Some(ExplainFormat::Mermaid)));
    }

    #[test]
    fn overrides_replace_configured_values() {
        let mut config = ConfigLoader::parse(
            "[research]\nmax_rounds = 7\n\n[llm]\nprovider = \"openai\"\n",
        )
        .unwrap();
        let overrides = Overrides {
            offline: true,
            max_rounds: Some(2),
            convergence: Some(ConvergenceArg::Sufficiency),
        };

        apply_overrides(&mut config, &overrides);

        assert_eq!(config.llm.provider, LlmProvider::Stub);
        assert_eq!(config.research.max_rounds, 2);
        assert_eq!(config.research.convergence, ConvergenceStrategy::Sufficiency);
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[tokio::test]
    async fn offline_run_completes_with_a_report() {
        let config = Config::default();
        let driver = build_driver(&config).await.unwrap();
        let service = ResearchService::new(driver.clone(), "stub-model");
        let session = service.create("soil carbon", "local", None).await.unwrap();

        let session = drive(&driver, &session.id).await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.final_report.as_deref().unwrap().contains("soil carbon"));
        assert!(print_outcome(&session, &OutputArgs::default()).is_ok());
    }
}
