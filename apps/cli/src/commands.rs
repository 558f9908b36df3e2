//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{info, warn};

use updaterelay_core::validator;
use updaterelay_core::{PipelineObserver, UpdatePipeline};
use updaterelay_shared::{
    AppConfig, Category, Payload, PipelineConfig, UpdateRecord, init_config, load_config,
    load_config_from,
};
use updaterelay_webhooks::DeliveryReport;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// updaterelay: validate, cache, and distribute content updates.
#[derive(Parser)]
#[command(
    name = "updaterelay",
    version,
    about = "Validate, cache, and distribute content updates to webhook subscribers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.updaterelay/updaterelay.toml).
    #[arg(long, global = true, env = "UPDATERELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a JSON-lines file of updates through the pipeline.
    Ingest {
        /// File with one `{category, payload, source, version, timestamp?}` per line.
        file: PathBuf,

        /// Extra subscription as `category=url` (repeatable).
        #[arg(long = "webhook", value_name = "CATEGORY=URL")]
        webhooks: Vec<String>,

        /// Override the cache TTL in seconds.
        #[arg(long)]
        ttl_seconds: Option<u64>,

        /// Allow webhooks on loopback/private addresses.
        #[arg(long)]
        allow_private_targets: bool,
    },

    /// Check a JSON-lines file without processing it.
    Validate {
        /// File to check.
        file: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
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
        0 => "updaterelay=info",
        1 => "updaterelay=debug",
        _ => "updaterelay=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Ingest {
            file,
            webhooks,
            ttl_seconds,
            allow_private_targets,
        } => {
            let mut config = resolve_config(config_path)?;
            if let Some(ttl) = ttl_seconds {
                config.cache.ttl_seconds = ttl;
            }
            if allow_private_targets {
                config.webhooks.allow_private_targets = true;
            }
            config.validate()?;
            cmd_ingest(&file, &config, &webhooks).await
        }
        Command::Validate { file } => cmd_validate(&file),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// Input format
// ---------------------------------------------------------------------------

/// One line of an ingest file.
#[derive(Debug, Deserialize)]
struct IngestLine {
    category: String,
    payload: Payload,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default = "default_version")]
    version: String,
    timestamp: Option<DateTime<Utc>>,
}

fn default_source() -> String {
    "cli".into()
}

fn default_version() -> String {
    "1".into()
}

impl IngestLine {
    fn into_record(self) -> Result<UpdateRecord> {
        let category = validator::parse_category(&self.category)?;
        let record = UpdateRecord::new(category, self.payload, self.source, self.version);
        Ok(match self.timestamp {
            Some(ts) => record.with_timestamp(ts),
            None => record,
        })
    }
}

/// Non-blank lines of `file` with their 1-based line numbers.
fn read_lines(file: &Path) -> Result<Vec<(usize, String)>> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    Ok(content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| (n + 1, line.to_string()))
        .collect())
}

fn parse_line(line: &str) -> Result<UpdateRecord> {
    let parsed: IngestLine =
        serde_json::from_str(line).map_err(|e| eyre!("malformed update: {e}"))?;
    parsed.into_record()
}

/// `category=url` → `(Category, url)`.
fn parse_webhook_arg(arg: &str) -> Result<(Category, String)> {
    let (category, url) = arg
        .split_once('=')
        .ok_or_else(|| eyre!("invalid --webhook '{arg}': expected CATEGORY=URL"))?;
    Ok((validator::parse_category(category.trim())?, url.trim().to_string()))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_ingest(file: &Path, config: &AppConfig, webhooks: &[String]) -> Result<()> {
    let lines = read_lines(file)?;
    let pipeline_config = PipelineConfig::from(config);

    let mut subscriptions: Vec<(Category, String)> = config
        .subscriptions
        .iter()
        .map(|s| (s.category, s.url.clone()))
        .collect();
    for arg in webhooks {
        subscriptions.push(parse_webhook_arg(arg)?);
    }

    info!(
        file = %file.display(),
        lines = lines.len(),
        subscriptions = subscriptions.len(),
        "ingesting updates"
    );

    let progress = Arc::new(CliProgress::new());
    let pipeline = UpdatePipeline::with_observer(&pipeline_config, progress.clone())?;

    for (category, url) in &subscriptions {
        if !pipeline.register_webhook(*category, url) {
            warn!(%category, url = %url, "subscription not registered");
        }
    }

    let mut malformed = 0usize;
    for (n, line) in &lines {
        match parse_line(line) {
            Ok(record) => {
                pipeline.enqueue_record(record).await;
            }
            Err(e) => {
                warn!(line = n, error = %e, "skipping line");
                malformed += 1;
            }
        }
    }

    progress.phase("Waiting for deliveries");
    pipeline.flush().await;

    let redelivered = if progress.deferred.load(Ordering::Relaxed) > 0 {
        progress.phase("Redelivering deferred webhooks");
        Some(pipeline.redeliver_deferred().await)
    } else {
        None
    };

    let stats = pipeline.get_cache_stats();
    let history = pipeline.get_error_history(None);
    let breakers = pipeline.breaker_states();
    pipeline.shutdown().await;
    progress.finish();

    let mut errors_by_category: BTreeMap<String, usize> = BTreeMap::new();
    for ctx in &history {
        *errors_by_category.entry(ctx.category.to_string()).or_default() += 1;
    }

    println!();
    println!("  Ingest complete");
    println!("  Accepted:    {}", progress.accepted.load(Ordering::Relaxed));
    println!(
        "  Rejected:    {}",
        progress.rejected.load(Ordering::Relaxed) + malformed
    );
    println!("  Cached:      {}", progress.cached.load(Ordering::Relaxed));
    println!(
        "  Delivered:   {}/{}",
        progress.delivered.load(Ordering::Relaxed),
        progress.deliveries.load(Ordering::Relaxed)
    );
    if let Some(report) = redelivered {
        println!(
            "  Redelivered: {}/{}",
            report.delivered(),
            report.deliveries.len()
        );
    }
    println!(
        "  Cache:       ttl={} recency={} queue={}",
        stats.ttl_size, stats.recency_size, stats.queue_depth
    );
    if !errors_by_category.is_empty() {
        println!("  Errors:");
        for (category, count) in &errors_by_category {
            println!("    {category:<16} {count}");
        }
    }
    for breaker in breakers.iter().filter(|b| b.failure_count > 0) {
        println!(
            "  Breaker:     {} {} ({} failures)",
            breaker.key, breaker.state, breaker.failure_count
        );
    }
    println!();

    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let lines = read_lines(file)?;
    let now = Utc::now();
    let mut invalid = 0usize;

    for (n, line) in &lines {
        let outcome = parse_line(line).and_then(|record| {
            validator::validate_record(&record, now).map_err(|e| {
                let missing = validator::missing_fields(record.category(), record.payload());
                if missing.is_empty() {
                    eyre!("{e}")
                } else {
                    eyre!("{} missing: {}", record.category(), missing.join(", "))
                }
            })
        });

        match outcome {
            Ok(()) => println!("  line {n:>4}: ok"),
            Err(e) => {
                invalid += 1;
                println!("  line {n:>4}: {e}");
            }
        }
    }

    println!();
    println!("  {} lines, {invalid} invalid", lines.len());

    if invalid > 0 {
        return Err(eyre!("{invalid} of {} updates are invalid", lines.len()));
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner plus counters fed by the pipeline.
struct CliProgress {
    spinner: ProgressBar,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    cached: AtomicUsize,
    deliveries: AtomicUsize,
    delivered: AtomicUsize,
    deferred: AtomicUsize,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self {
            spinner,
            accepted: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            deliveries: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            deferred: AtomicUsize::new(0),
        }
    }

    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn refresh(&self) {
        self.spinner.set_message(format!(
            "Processed {} / accepted {} · deliveries {}/{}",
            self.cached.load(Ordering::Relaxed),
            self.accepted.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
            self.deliveries.load(Ordering::Relaxed),
        ));
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl PipelineObserver for CliProgress {
    fn accepted(&self, _record: &UpdateRecord) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.refresh();
    }

    fn rejected(&self, record: &UpdateRecord, reason: &str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.spinner
            .set_message(format!("Rejected {} update: {reason}", record.category()));
    }

    fn processed(&self, _record: &UpdateRecord, cached: bool) {
        if cached {
            self.cached.fetch_add(1, Ordering::Relaxed);
        }
        self.refresh();
    }

    fn delivered(&self, report: &DeliveryReport) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        match report.status {
            updaterelay_webhooks::DeliveryStatus::Delivered { .. } => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            updaterelay_webhooks::DeliveryStatus::Deferred => {
                self.deferred.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_arg_parses() {
        let (category, url) = parse_webhook_arg("job=https://hooks.example.com/jobs").unwrap();
        assert_eq!(category, Category::Job);
        assert_eq!(url, "https://hooks.example.com/jobs");

        assert!(parse_webhook_arg("https://hooks.example.com").is_err());
        assert!(parse_webhook_arg("podcast=https://hooks.example.com").is_err());
    }

    #[test]
    fn line_with_defaults() {
        let record = parse_line(
            r#"{"category":"resource","payload":{"title":"Guide","type":"pdf","url":"https://x.dev"}}"#,
        )
        .unwrap();
        assert_eq!(record.category(), Category::Resource);
        assert_eq!(record.source(), "cli");
        assert_eq!(record.version(), "1");
    }

    #[test]
    fn line_keeps_producer_timestamp() {
        let record = parse_line(
            r#"{"category":"profile","payload":{},"source":"crm","version":"2","timestamp":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(record.timestamp().to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn bad_lines_rejected() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line(r#"{"category":"podcast","payload":{}}"#).is_err());
    }
}
