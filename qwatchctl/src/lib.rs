use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use qwatch_core::{
    load_app_config, transport_from_section, AlertRunner, AppConfig, ConfigError, EngineError,
    MonitorConfig, NotificationTransport, RunError, RunReport, SqliteBackend, SqliteQueueEngine,
    SqliteQueueEngineBuilder, StateStore, StoreError, StoredAlert, TransportError,
};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Run(#[from] RunError),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{failures} queue(s) failed during the pass")]
    PartialFailure { failures: usize },
}

type Runner = AlertRunner<SqliteQueueEngine, SqliteBackend, dyn NotificationTransport>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Queue backlog alerting control interface", long_about = None)]
pub struct Cli {
    /// Path to qwatch.toml
    #[arg(long, default_value = "configs/qwatch.toml")]
    pub config: PathBuf,
    /// Alternative path for the alert state database
    #[arg(long)]
    pub state_db: Option<PathBuf>,
    /// Alternative path for the job database
    #[arg(long)]
    pub engine_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validates the monitor options and prints the normalized configuration
    Validate,
    /// Runs a single evaluation pass
    Run(RunArgs),
    /// Runs evaluation passes on a fixed cadence until interrupted
    Watch(WatchArgs),
    /// Inspects or resets persisted alert state
    #[command(subcommand)]
    State(StateCommands),
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Exit with an error when any queue failed
    #[arg(long, default_value_t = false)]
    pub strict: bool,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Minutes between passes (defaults to [runner].interval_minutes)
    #[arg(long)]
    pub interval_minutes: Option<u64>,
    /// Stop after this many passes
    #[arg(long)]
    pub max_runs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Lists queues currently alerting
    Show,
    /// Forgets the alert state of one queue
    Reset(ResetArgs),
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    pub queue: String,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Installs the global subscriber. Logs go to stderr so JSON output on
/// stdout stays parseable.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "qwatchctl", &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(context.execute(&cli))
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: AppConfig,
    config_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_app_config(&config_path)?;

        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_paths(&config_dir);

        if let Some(path) = &cli.state_db {
            config.state.path = path.clone();
        }
        if let Some(path) = &cli.engine_db {
            config.engine.path = path.clone();
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    async fn execute(&self, cli: &Cli) -> Result<()> {
        match &cli.command {
            Commands::Validate => {
                let validated = self.validate()?;
                render(&validated, cli.format)?;
            }
            Commands::Run(args) => {
                let report = self.run_once().await?;
                render(&report, cli.format)?;
                if args.strict && !report.is_clean() {
                    return Err(AppError::PartialFailure {
                        failures: report.failures.len(),
                    });
                }
            }
            Commands::Watch(args) => {
                let summary = self.watch(args).await?;
                render(&summary, cli.format)?;
            }
            Commands::State(StateCommands::Show) => {
                let listing = self.state_show().await?;
                render(&listing, cli.format)?;
            }
            Commands::State(StateCommands::Reset(args)) => {
                let result = self.state_reset(&args.queue).await?;
                render(&result, cli.format)?;
            }
            Commands::Completions(_) => {}
        }
        Ok(())
    }

    fn monitor(&self) -> Result<MonitorConfig> {
        Ok(self.config.monitor.validate()?)
    }

    fn validate(&self) -> Result<ValidatedConfig> {
        Ok(ValidatedConfig {
            config_path: self.config_path.display().to_string(),
            monitor: self.monitor()?,
            state_db: self.config.state.path.display().to_string(),
            namespace: self.config.state.namespace.clone(),
            engine_db: self.config.engine.path.display().to_string(),
        })
    }

    fn state_store(&self) -> Result<StateStore<SqliteBackend>> {
        let backend = SqliteBackend::builder()
            .path(&self.config.state.path)
            .create_if_missing(true)
            .build()?;
        backend.initialize()?;
        Ok(StateStore::new(
            Arc::new(backend),
            self.config.state.namespace.clone(),
        ))
    }

    fn runner(&self) -> Result<Runner> {
        let engine = SqliteQueueEngineBuilder::from_section(&self.config.engine).build()?;
        let transport: Arc<dyn NotificationTransport> =
            Arc::from(transport_from_section(&self.config.transport)?);
        Ok(
            AlertRunner::new(Arc::new(engine), self.state_store()?, transport)
                .with_concurrency(self.config.runner.concurrency),
        )
    }

    async fn run_once(&self) -> Result<RunReport> {
        let monitor = self.monitor()?;
        let runner = self.runner()?;
        Ok(runner.run(&monitor, Utc::now()).await?)
    }

    async fn watch(&self, args: &WatchArgs) -> Result<WatchSummary> {
        let monitor = self.monitor()?;
        let runner = self.runner()?;
        let minutes = args
            .interval_minutes
            .unwrap_or(self.config.runner.interval_minutes)
            .max(1);
        let mut ticker = tokio::time::interval(StdDuration::from_secs(minutes * 60));
        let mut summary = WatchSummary {
            interval_minutes: minutes,
            ..WatchSummary::default()
        };

        tracing::info!(identity = monitor.identity(), minutes, "watching queues");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    summary.record(runner.run(&monitor, Utc::now()).await);
                    if args.max_runs.map(|max| summary.runs >= max).unwrap_or(false) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, stopping watch");
                    break;
                }
            }
        }
        Ok(summary)
    }

    async fn state_show(&self) -> Result<StateListing> {
        let monitor = self.monitor()?;
        let store = self.state_store()?;
        let alerts = store.list(monitor.identity()).await?;
        Ok(StateListing {
            identity: monitor.identity().to_string(),
            alerts,
        })
    }

    async fn state_reset(&self, queue: &str) -> Result<ResetResult> {
        let monitor = self.monitor()?;
        let store = self.state_store()?;
        let key = store.key(monitor.identity(), queue);
        let was_alerting = store.load(&key, Utc::now()).await?.is_alerting();
        store.reset(monitor.identity(), queue).await?;
        Ok(ResetResult {
            key: key.to_string(),
            was_alerting,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ValidatedConfig {
    pub config_path: String,
    pub monitor: MonitorConfig,
    pub state_db: String,
    pub namespace: String,
    pub engine_db: String,
}

#[derive(Debug, Default, Serialize)]
pub struct WatchSummary {
    pub interval_minutes: u64,
    pub runs: u64,
    pub failed_runs: u64,
    pub raised: usize,
    pub reraised: usize,
    pub cleared: usize,
    pub queue_failures: usize,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl WatchSummary {
    fn record(&mut self, outcome: std::result::Result<RunReport, RunError>) {
        self.runs += 1;
        match outcome {
            Ok(report) => {
                self.raised += report.raised;
                self.reraised += report.reraised;
                self.cleared += report.cleared;
                self.queue_failures += report.failures.len();
                self.last_run_at = report.started_at;
            }
            Err(err) => {
                self.failed_runs += 1;
                tracing::error!(error = %err, "evaluation pass failed");
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StateListing {
    pub identity: String,
    pub alerts: Vec<StoredAlert>,
}

#[derive(Debug, Serialize)]
pub struct ResetResult {
    pub key: String,
    pub was_alerting: bool,
}

impl DisplayFallback for ValidatedConfig {
    fn display(&self) -> String {
        let monitor = &self.monitor;
        let snooze = monitor
            .snooze_minutes()
            .map(|minutes| format!("{minutes} min"))
            .unwrap_or_else(|| "disabled".to_string());
        let exclude = monitor
            .exclude()
            .map(|pattern| pattern.to_string())
            .unwrap_or_else(|| "-".to_string());
        [
            format!("Config: {}", self.config_path),
            format!("Identity: {}", monitor.identity()),
            format!("Queues: {}", monitor.include()),
            format!("Excluded: {}", exclude),
            format!("Threshold: {}", monitor.threshold()),
            format!("Snooze: {}", snooze),
            format!("Notify on recovery: {}", monitor.notify_on_recovery()),
            format!("State: {} (namespace {})", self.state_db, self.namespace),
            format!("Jobs: {}", self.engine_db),
        ]
        .join("\n")
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "[{identity}] matched {matched}/{discovered} | evaluated={evaluated} raised={raised} reraised={reraised} cleared={cleared} notified={notified}",
            identity = self.identity,
            matched = self.matched,
            discovered = self.discovered,
            evaluated = self.evaluated,
            raised = self.raised,
            reraised = self.reraised,
            cleared = self.cleared,
            notified = self.notified,
        )];
        for failure in &self.failures {
            lines.push(format!(
                "  ! {queue} ({stage}): {message}",
                queue = failure.queue,
                stage = failure.stage,
                message = failure.message
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for WatchSummary {
    fn display(&self) -> String {
        format!(
            "{runs} pass(es) every {minutes} min | failed={failed} raised={raised} reraised={reraised} cleared={cleared} queue_failures={queue_failures}",
            runs = self.runs,
            minutes = self.interval_minutes,
            failed = self.failed_runs,
            raised = self.raised,
            reraised = self.reraised,
            cleared = self.cleared,
            queue_failures = self.queue_failures,
        )
    }
}

impl DisplayFallback for StateListing {
    fn display(&self) -> String {
        if self.alerts.is_empty() {
            return format!("[{}] no queue alerting", self.identity);
        }
        let mut lines = Vec::new();
        for alert in &self.alerts {
            lines.push(format!(
                "{queue} | since={since} | notifications={count}",
                queue = alert.queue,
                since = alert.state.since.to_rfc3339(),
                count = alert.state.sending_number,
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ResetResult {
    fn display(&self) -> String {
        if self.was_alerting {
            format!("{} reset", self.key)
        } else {
            format!("{} was not alerting", self.key)
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
        };
        write!(f, "{}", label)
    }
}
