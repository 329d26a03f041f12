//! evalq CLI: run an evaluation batch, or inspect a results store.

use clap::{Args, Parser, Subcommand, ValueEnum};
use evalq::config::{Config, EngineConfig};
use evalq::engine::{CancelMode, EvaluationEngine};
use evalq::input::{InputError, JsonlItems};
use evalq::llm::{ChatSubmitter, anthropic_client, openai_client};
use evalq::model::{Item, Outcome, Summary};
use evalq::store::{JsonlStore, ResultStore, SqliteStore, StoreStats};
use evalq::submit::Submitter;
use evalq::telemetry::{TelemetryConfig, init_telemetry};
use rig::client::CompletionClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "evalq", about = "Rate-limited, resumable LLM evaluation runs")]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate every input item not already in the results store
    Run(RunArgs),
    /// Show how many results a store holds
    Status {
        /// Results store path
        #[arg(long)]
        output: PathBuf,
        /// Store backend (inferred from the extension when omitted)
        #[arg(long, value_enum)]
        store: Option<StoreKind>,
        /// Number of recorded failures to list
        #[arg(long, default_value_t = 10)]
        failures: usize,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Input items, one JSON object per line
    #[arg(long)]
    input: PathBuf,
    /// Results store path; reused across runs to resume
    #[arg(long)]
    output: PathBuf,
    /// Store backend (inferred from the extension when omitted)
    #[arg(long, value_enum)]
    store: Option<StoreKind>,
    #[arg(long, value_enum, default_value_t = Provider::Openai)]
    provider: Provider,
    /// TOML engine config
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
}

/// Flags that override values from the config file.
#[derive(Args)]
struct Overrides {
    /// Requests admitted per window
    #[arg(long)]
    request_rate_limit: Option<u32>,
    /// Rate-limit window length in seconds
    #[arg(long)]
    window_secs: Option<u64>,
    /// Maximum items in flight
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    max_tokens: Option<u32>,
    /// Completions per item (OpenAI only)
    #[arg(long)]
    n: Option<u32>,
    /// Per-attempt timeout in seconds (0 disables)
    #[arg(long)]
    request_timeout: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut EngineConfig) {
        if let Some(v) = self.request_rate_limit {
            config.requests_per_window = v;
        }
        if let Some(v) = self.window_secs {
            config.window_secs = v;
        }
        if let Some(v) = self.workers {
            config.max_concurrency = v;
        }
        if let Some(v) = self.max_attempts {
            config.max_attempts = v;
        }
        if let Some(v) = self.model {
            config.model = v;
        }
        if let Some(v) = self.temperature {
            config.temperature = v;
        }
        if let Some(v) = self.max_tokens {
            config.max_tokens = v;
        }
        if let Some(v) = self.n {
            config.n = v;
        }
        if let Some(v) = self.request_timeout {
            config.request_timeout_secs = v;
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Jsonl,
    Sqlite,
}

impl StoreKind {
    fn infer(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("db" | "sqlite" | "sqlite3") => Self::Sqlite,
            _ => Self::Jsonl,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    Anthropic,
    Openai,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let default_filter = if cli.verbose {
        "evalq=debug,info".to_string()
    } else {
        config.log_level.clone()
    };
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "evalq".to_string(),
        default_filter,
    })?;

    match cli.command {
        Command::Run(args) => cmd_run(&config, args).await,
        Command::Status {
            output,
            store,
            failures,
        } => cmd_status(&output, store, failures),
    }
}

fn open_store(path: &Path, kind: Option<StoreKind>) -> anyhow::Result<Arc<dyn ResultStore>> {
    let store: Arc<dyn ResultStore> = match kind.unwrap_or_else(|| StoreKind::infer(path)) {
        StoreKind::Jsonl => Arc::new(JsonlStore::open(path)?),
        StoreKind::Sqlite => Arc::new(SqliteStore::open(path)?),
    };
    Ok(store)
}

async fn cmd_run(config: &Config, args: RunArgs) -> anyhow::Result<()> {
    let mut engine_config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    args.overrides.apply(&mut engine_config);
    engine_config.validate()?;

    let store = open_store(&args.output, args.store)?;
    let items = JsonlItems::open(&args.input)?;

    let summary = match args.provider {
        Provider::Anthropic => {
            let client = anthropic_client(config.api_key("anthropic")?)
                .map_err(|e| anyhow::anyhow!("failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(engine_config.model.as_str());
            evaluate(&engine_config, ChatSubmitter::new(model, "anthropic"), store, items).await?
        }
        Provider::Openai => {
            let client = openai_client(config.api_key("openai")?)
                .map_err(|e| anyhow::anyhow!("failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(engine_config.model.as_str());
            evaluate(&engine_config, ChatSubmitter::new(model, "openai"), store, items).await?
        }
    };

    print_summary(&summary);
    Ok(())
}

/// Run the engine with Ctrl-C wired to cancellation: the first interrupt
/// drains, the second aborts.
async fn evaluate<S: Submitter>(
    config: &EngineConfig,
    submitter: S,
    store: Arc<dyn ResultStore>,
    items: impl IntoIterator<Item = Result<Item, InputError>>,
) -> anyhow::Result<Summary> {
    let engine = EvaluationEngine::from_config(config, submitter, store);

    let handle = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupted: finishing in-flight items, press Ctrl-C again to abort");
        handle.cancel(CancelMode::Drain);
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("aborting in-flight items");
            handle.cancel(CancelMode::Abort);
        }
    });

    let summary = engine.run(items, config.max_concurrency).await?;
    println!("Run:        {}", engine.run_id());
    Ok(summary)
}

fn print_summary(summary: &Summary) {
    println!("Completed:  {}", summary.completed);
    println!("Failed:     {}", summary.failed);
    println!("Skipped:    {}", summary.skipped);
    if summary.cancelled {
        println!("Aborted:    {}", summary.aborted);
        println!("Run was cancelled; rerun with the same --output to resume.");
    }
    if !summary.errors.is_empty() {
        println!("---");
        for err in &summary.errors {
            println!("{:<24}  {:<13}  {}", err.id, err.kind, err.message);
        }
    }
}

fn cmd_status(output: &Path, kind: Option<StoreKind>, failures: usize) -> anyhow::Result<()> {
    if !output.exists() {
        println!("No results at {}.", output.display());
        return Ok(());
    }
    let store = open_store(output, kind)?;
    let stats = StoreStats::collect(store.as_ref())?;

    println!("Store:      {}", output.display());
    println!("Succeeded:  {}", stats.succeeded);
    println!("Failed:     {}", stats.failed);
    println!("Total:      {}", stats.total());

    if failures > 0 && stats.failed > 0 {
        println!("---");
        let records = store.records()?;
        for record in records.iter().filter(|r| !r.outcome.is_success()).take(failures) {
            if let Outcome::Failure { kind, error } = &record.outcome {
                println!(
                    "{:<24}  {:<13}  {:<3}  {}",
                    record.id,
                    kind,
                    record.attempts.len(),
                    error
                );
            }
        }
    }
    Ok(())
}
