//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use leadflow_core::{
    BatchReport, OpenRouterClient, Pipeline, PipelineInput, PipelineObserver, RunOutcome, Stage,
    TextService,
};
use leadflow_shared::{
    AppConfig, CacheBackend, PipelineSettings, RawPayload, expand_home, init_config, load_config,
};
use leadflow_storage::{CacheStore, JsonLinesSink, MemoryCache, RecordSink, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Leadflow: enrich, summarize and score B2B leads.
#[derive(Parser)]
#[command(
    name = "leadflow",
    version,
    about = "Enrich company identifiers into scored B2B lead records.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Result output format for `run` and `records list`.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline over one or more company identifiers.
    Run {
        /// Company names or domains.
        identifiers: Vec<String>,

        /// JSON Lines file of `{"identifier": ..., "payload": {...}}` inputs.
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Append finalized records to this JSON Lines file instead of the database.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Database path (defaults to `defaults.db_path`).
        #[arg(long)]
        db: Option<String>,

        /// Identifiers processed concurrently (defaults to `defaults.concurrency`).
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Result output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Provider response cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Inspect stored lead records.
    Records {
        #[command(subcommand)]
        action: RecordsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Remove expired cache entries.
    Purge {
        /// Remove every entry, live or not.
        #[arg(long)]
        all: bool,

        /// Database path (defaults to `defaults.db_path`).
        #[arg(long)]
        db: Option<String>,
    },
}

/// Records subcommands.
#[derive(Subcommand)]
pub(crate) enum RecordsAction {
    /// List stored records, highest score first.
    List {
        /// Database path (defaults to `defaults.db_path`).
        #[arg(long)]
        db: Option<String>,

        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "leadflow=info",
        1 => "leadflow=debug",
        _ => "leadflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // logs go to stderr so `--format json` output stays machine-readable
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            identifiers,
            input,
            out,
            db,
            concurrency,
            format,
        } => {
            cmd_run(RunArgs {
                identifiers,
                input,
                out,
                db,
                concurrency,
                format,
            })
            .await
        }
        Command::Cache { action } => match action {
            CacheAction::Purge { all, db } => cmd_cache_purge(all, db.as_deref()).await,
        },
        Command::Records { action } => match action {
            RecordsAction::List { db, format } => cmd_records_list(db.as_deref(), format).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunArgs {
    identifiers: Vec<String>,
    input: Option<PathBuf>,
    out: Option<PathBuf>,
    db: Option<String>,
    concurrency: Option<usize>,
    format: OutputFormat,
}

/// One line of an `--input` file.
#[derive(Debug, Deserialize)]
struct InputLine {
    identifier: String,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
    /// Provider id the payload is normalized as.
    #[serde(default = "default_input_provider")]
    provider: String,
}

fn default_input_provider() -> String {
    "input".into()
}

/// Parse JSON Lines inputs; blank lines are skipped.
fn parse_inputs(content: &str) -> Result<Vec<PipelineInput>> {
    let mut inputs = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: InputLine = serde_json::from_str(line)
            .map_err(|e| eyre!("invalid input on line {}: {e}", n + 1))?;
        inputs.push(match parsed.payload {
            Some(data) => PipelineInput::with_payload(
                parsed.identifier,
                RawPayload::new(parsed.provider, data),
            ),
            None => PipelineInput::new(parsed.identifier),
        });
    }
    Ok(inputs)
}

/// The database is opened only for a libSQL cache or when records go to it.
fn needs_database(backend: CacheBackend, out: Option<&Path>) -> bool {
    backend == CacheBackend::Libsql || out.is_none()
}

fn resolve_db(config: &AppConfig, db: Option<&str>) -> Result<PathBuf> {
    Ok(expand_home(db.unwrap_or(&config.defaults.db_path))?)
}

/// Build the text service, or `None` when insights are off or no key is set.
fn text_service(config: &AppConfig) -> Option<Arc<dyn TextService>> {
    if !config.insights.summarize && !config.insights.detect_signals {
        return None;
    }
    match OpenRouterClient::from_config(config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(kind = e.kind(), error = %e, "text insights disabled");
            None
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_config()?;

    let mut inputs: Vec<PipelineInput> = args
        .identifiers
        .iter()
        .map(|id| PipelineInput::new(id.as_str()))
        .collect();
    if let Some(path) = &args.input {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
        inputs.extend(parse_inputs(&content)?);
    }
    if inputs.is_empty() {
        return Err(eyre!("no identifiers given; pass them as arguments or with --input"));
    }

    let mut settings = PipelineSettings::from(&config);
    if let Some(n) = args.concurrency {
        settings.concurrency = n.max(1);
    }

    let db_path = resolve_db(&config, args.db.as_deref())?;
    let storage = if needs_database(config.cache.backend, args.out.as_deref()) {
        Some(Arc::new(Storage::open(&db_path).await?))
    } else {
        None
    };

    let cache: Arc<dyn CacheStore> = match (config.cache.backend, &storage) {
        (CacheBackend::Libsql, Some(storage)) => storage.clone(),
        _ => Arc::new(MemoryCache::new()),
    };
    let sink: Arc<dyn RecordSink> = match (&args.out, &storage) {
        (Some(path), _) => Arc::new(JsonLinesSink::open(path).await?),
        (None, Some(storage)) => storage.clone(),
        (None, None) => return Err(eyre!("no record sink available")),
    };

    let pipeline = Pipeline::from_config(&config, settings, cache, sink, text_service(&config))?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight identifiers");
            ctrl_c.cancel();
        }
    });

    info!(
        identifiers = inputs.len(),
        db = storage.as_ref().map(|_| db_path.display().to_string()),
        out = args.out.as_ref().map(|p| p.display().to_string()),
        "starting run"
    );

    let progress = CliProgress::new();
    let report = pipeline.run(inputs, &progress, &cancel).await;
    progress.finish();

    print_report(&report, args.format)?;

    let failed = report.failed();
    if failed > 0 {
        return Err(eyre!("{failed} of {} identifiers failed", report.outcomes.len()));
    }
    Ok(())
}

fn print_report(report: &BatchReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            for outcome in &report.outcomes {
                let line = match &outcome.result {
                    Ok(record) => serde_json::to_value(record)?,
                    Err(e) => serde_json::json!({
                        "identifier": outcome.identifier,
                        "error": e.to_string(),
                        "kind": e.kind(),
                    }),
                };
                println!("{line}");
            }
        }
        OutputFormat::Text => {
            println!();
            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(record) => {
                        let score = record
                            .record()
                            .score()
                            .map_or_else(|| "-".to_string(), |s| s.to_string());
                        let degraded: Vec<&str> =
                            outcome.degraded.iter().map(|d| d.stage.as_str()).collect();
                        let note = if degraded.is_empty() {
                            String::new()
                        } else {
                            format!("  (degraded: {})", degraded.join(", "))
                        };
                        println!("  {:<30} score {score:>3}{note}", outcome.identifier);
                    }
                    Err(e) => println!("  {:<30} failed: {e}", outcome.identifier),
                }
            }
            println!();
            println!("  Run:        {}", report.run_id);
            println!("  Finalized:  {}", report.finalized());
            println!("  Failed:     {}", report.failed());
            println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
            println!();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress observer
// ---------------------------------------------------------------------------

/// Pipeline observer drawing an indicatif progress bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineObserver for CliProgress {
    fn started(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn stage(&self, identifier: &str, stage: Stage) {
        self.bar.set_message(format!("{identifier}: {stage}"));
    }

    fn finished(&self, outcome: &RunOutcome) {
        self.bar.inc(1);
        if let Some(e) = outcome.error() {
            self.bar
                .println(format!("  ✗ {}: {}", outcome.identifier, e.kind()));
        }
    }
}

// ---------------------------------------------------------------------------
// cache / records / config
// ---------------------------------------------------------------------------

async fn open_existing(path: &Path, readonly: bool) -> Result<Storage> {
    if !path.exists() {
        return Err(eyre!("no database at '{}'; run `leadflow run` first", path.display()));
    }
    let storage = if readonly {
        Storage::open_readonly(path).await?
    } else {
        Storage::open(path).await?
    };
    Ok(storage)
}

async fn cmd_cache_purge(all: bool, db: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let path = resolve_db(&config, db)?;
    let storage = open_existing(&path, false).await?;

    let removed = if all {
        storage.purge_cache().await?
    } else {
        storage.evict_expired().await?
    };
    info!(removed, all, "cache purged");
    println!("Removed {removed} cache entries.");
    Ok(())
}

async fn cmd_records_list(db: Option<&str>, format: OutputFormat) -> Result<()> {
    let config = load_config()?;
    let path = resolve_db(&config, db)?;
    let storage = open_existing(&path, true).await?;

    let records = storage.list_records().await?;
    match format {
        OutputFormat::Json => {
            for meta in &records {
                println!(
                    "{}",
                    serde_json::json!({
                        "identifier": meta.identifier,
                        "run_id": meta.run_id,
                        "score": meta.score,
                        "finalized_at": meta.finalized_at,
                    })
                );
            }
        }
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No records stored.");
            }
            for meta in &records {
                let score = meta.score.map_or_else(|| "-".to_string(), |s| s.to_string());
                println!("  {:<30} {score:>3}  {}", meta.identifier, meta.finalized_at);
            }
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_lines() {
        let content = r#"
{"identifier": "Acme"}
{"identifier": "Globex", "payload": {"industry": "Energy"}, "provider": "crm"}
"#;
        let inputs = parse_inputs(content).unwrap();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0].preloaded.is_none());
        let preloaded = inputs[1].preloaded.as_ref().unwrap();
        assert_eq!(preloaded.provider_id(), "crm");
        assert_eq!(preloaded.get("industry"), Some(&Value::from("Energy")));
    }

    #[test]
    fn bad_input_line_reports_line_number() {
        let err = parse_inputs("{\"identifier\": \"Acme\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn database_opened_only_when_used() {
        let out = Path::new("leads.jsonl");
        assert!(!needs_database(CacheBackend::Memory, Some(out)));
        assert!(needs_database(CacheBackend::Libsql, Some(out)));
        assert!(needs_database(CacheBackend::Memory, None));
        assert!(needs_database(CacheBackend::Libsql, None));
    }

    #[test]
    fn run_command_parses_flags() {
        let cli = Cli::try_parse_from([
            "leadflow",
            "run",
            "Acme",
            "Globex",
            "--concurrency",
            "8",
            "--format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                identifiers,
                concurrency,
                ..
            } => {
                assert_eq!(identifiers, vec!["Acme", "Globex"]);
                assert_eq!(concurrency, Some(8));
            }
            _ => panic!("expected run"),
        }
    }
}
