//! Command surface for the inference ledger.
//!
//! Hosts embed the CLI through [`run_cli`] for full parsed execution, or
//! [`run_query`] to execute a read command against an already opened
//! [`SqliteLedgerStore`]. Read commands resolve every argument before the
//! store is touched.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use inference_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, CurationMetric, CurationRequest, Episode,
    FeedbackInput, FeedbackValue, FunctionType, Inference, InferenceInput, LedgerConfig,
    LedgerError, LedgerId, LedgerQueries, MetricConfig, MetricKind, PageRequest, TableBounds,
    VariantCount, VariantShape,
};
use inference_ledger_store_sqlite::SqliteLedgerStore;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ledger")]
#[command(about = "Inference ledger query and curation CLI")]
pub struct Cli {
    #[arg(long, default_value = "./ledger.sqlite3")]
    db: PathBuf,

    /// Declared functions and metrics; optional when every command passes
    /// inline `--variant-shape` / `--metric-config` JSON.
    #[arg(long, default_value = "./ledger.toml")]
    config: PathBuf,

    /// Tracing filter directive; overrides `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    #[command(flatten)]
    Query(QueryCommand),
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    Inferences {
        #[command(subcommand)]
        command: Box<InferencesCommand>,
    },
    Episodes {
        #[command(subcommand)]
        command: Box<EpisodesCommand>,
    },
    Count {
        #[command(subcommand)]
        command: Box<CountCommand>,
    },
    Curate {
        #[command(subcommand)]
        command: Box<CurateCommand>,
    },
    Health,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Inference(RecordInferenceArgs),
    Feedback(RecordFeedbackArgs),
}

#[derive(Debug, Args)]
pub struct RecordInferenceArgs {
    #[arg(long)]
    function: String,
    #[arg(long)]
    variant: String,
    #[arg(long)]
    episode_id: String,
    #[arg(long)]
    id: Option<String>,
    #[command(flatten)]
    shape: ShapeArgs,
    #[arg(long, default_value = "{}")]
    input_json: String,
    #[arg(long, default_value = "{}")]
    output_json: String,
}

#[derive(Debug, Args)]
pub struct RecordFeedbackArgs {
    #[arg(long)]
    metric: String,
    #[arg(long)]
    target_id: String,
    /// `true`/`false` for boolean metrics, a number for float metrics, JSON
    /// for demonstrations.
    #[arg(long)]
    value: String,
    #[arg(long)]
    metric_config: Option<String>,
    #[arg(long)]
    feedback_id: Option<String>,
    #[arg(long)]
    occurred_at: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ShapeArgs {
    /// Inline variant shape, e.g. `{"type":"json"}`; wins over the config file.
    #[arg(long)]
    variant_shape: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct PageArgs {
    #[arg(long)]
    before: Option<String>,
    #[arg(long)]
    after: Option<String>,
    #[arg(long, default_value_t = 10)]
    page_size: u32,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum InferencesCommand {
    List(PageArgs),
    Bounds,
}

#[derive(Debug, Subcommand)]
pub enum EpisodesCommand {
    List(PageArgs),
    Bounds,
    Show(EpisodeShowArgs),
}

#[derive(Debug, Args)]
pub struct EpisodeShowArgs {
    #[arg(long)]
    episode_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum CountCommand {
    Inferences(FunctionArgs),
    Feedback(MetricArgs),
    ByVariant(FunctionArgs),
}

#[derive(Debug, Args)]
pub struct FunctionArgs {
    #[arg(long)]
    function: String,
    #[command(flatten)]
    shape: ShapeArgs,
}

#[derive(Debug, Args)]
pub struct MetricArgs {
    #[arg(long)]
    function: String,
    #[command(flatten)]
    shape: ShapeArgs,
    #[arg(long)]
    metric: String,
    /// Inline metric config, e.g. `{"type":"boolean","optimize":"max","level":"inference"}`.
    #[arg(long)]
    metric_config: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum CurateCommand {
    Count(CurateArgs),
    List(CurateListArgs),
}

#[derive(Debug, Args)]
pub struct CurateArgs {
    #[arg(long)]
    function: String,
    #[command(flatten)]
    shape: ShapeArgs,
    #[arg(long)]
    metric: Option<String>,
    #[arg(long)]
    metric_config: Option<String>,
    #[arg(long, default_value_t = 0.0)]
    threshold: f64,
}

#[derive(Debug, Args)]
pub struct CurateListArgs {
    #[command(flatten)]
    curate: CurateArgs,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store access, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Command::Migrate => {
            let store = SqliteLedgerStore::open(&cli.db)?;
            store.migrate()?;
            info!(db = %cli.db.display(), "ledger migrated");
            println!(
                "{}",
                serde_json::to_string_pretty(&MigratePayload {
                    contract_version: "migrate.v1".to_string(),
                    db: cli.db.display().to_string(),
                    migrated: true,
                })?
            );
            Ok(())
        }
        Command::Record { command } => {
            let config = load_config(&cli.config)?;
            let store = SqliteLedgerStore::open(&cli.db)?;
            store.migrate()?;
            run_record(*command, &store, &config)
        }
        Command::Query(QueryCommand::Health) => run_health(&cli.db),
        Command::Query(command) => {
            let config = load_config(&cli.config)?;
            let prepared = prepare_query(command, &config)?;
            let store = SqliteLedgerStore::open_read_only(&cli.db)?;
            execute_query(prepared, &store)
        }
    }
}

/// Executes a read command against an existing store handle.
///
/// # Errors
/// Returns an error when argument resolution or the underlying query fails.
pub fn run_query(
    command: QueryCommand,
    store: &SqliteLedgerStore,
    config: &LedgerConfig,
) -> Result<()> {
    execute_query(prepare_query(command, config)?, store)
}

/// A read command with every argument parsed and resolved against the
/// config, so nothing left can fail before the store is consulted.
#[derive(Debug)]
enum PreparedQuery {
    InferencePage { page: PageRequest, json: bool },
    InferenceBounds,
    EpisodePage { page: PageRequest, json: bool },
    EpisodeBounds,
    EpisodeShow { episode_id: LedgerId, json: bool },
    CountInferences { function_name: String, shape: VariantShape },
    CountFeedback {
        function_name: String,
        shape: VariantShape,
        metric_name: String,
        metric: MetricConfig,
    },
    CountByVariant { function_name: String, shape: VariantShape },
    CurateCount(CurationRequest),
    CurateList { request: CurationRequest, json: bool },
    Health,
}

/// Resolves cursors, shapes and metrics up front, so usage and
/// configuration errors surface even when the store is unavailable.
fn prepare_query(command: QueryCommand, config: &LedgerConfig) -> Result<PreparedQuery> {
    let prepared = match command {
        QueryCommand::Inferences { command } => match *command {
            InferencesCommand::List(args) => PreparedQuery::InferencePage {
                page: checked_page_request(&args)?,
                json: args.json,
            },
            InferencesCommand::Bounds => PreparedQuery::InferenceBounds,
        },
        QueryCommand::Episodes { command } => match *command {
            EpisodesCommand::List(args) => PreparedQuery::EpisodePage {
                page: checked_page_request(&args)?,
                json: args.json,
            },
            EpisodesCommand::Bounds => PreparedQuery::EpisodeBounds,
            EpisodesCommand::Show(args) => PreparedQuery::EpisodeShow {
                episode_id: parse_id(&args.episode_id, "--episode-id")?,
                json: args.json,
            },
        },
        QueryCommand::Count { command } => match *command {
            CountCommand::Inferences(args) => PreparedQuery::CountInferences {
                shape: resolve_shape(config, &args.function, &args.shape)?,
                function_name: args.function,
            },
            CountCommand::Feedback(args) => PreparedQuery::CountFeedback {
                shape: resolve_shape(config, &args.function, &args.shape)?,
                metric: resolve_metric(config, &args.metric, args.metric_config.as_deref())?,
                function_name: args.function,
                metric_name: args.metric,
            },
            CountCommand::ByVariant(args) => PreparedQuery::CountByVariant {
                shape: resolve_shape(config, &args.function, &args.shape)?,
                function_name: args.function,
            },
        },
        QueryCommand::Curate { command } => match *command {
            CurateCommand::Count(args) => {
                PreparedQuery::CurateCount(curation_request(config, &args, None)?)
            }
            CurateCommand::List(args) => PreparedQuery::CurateList {
                request: curation_request(config, &args.curate, args.limit)?,
                json: args.json,
            },
        },
        QueryCommand::Health => PreparedQuery::Health,
    };
    Ok(prepared)
}

fn checked_page_request(args: &PageArgs) -> Result<PageRequest> {
    let page = page_request(args)?;
    page.cursor()?;
    Ok(page)
}

fn execute_query(prepared: PreparedQuery, store: &SqliteLedgerStore) -> Result<()> {
    match prepared {
        PreparedQuery::InferencePage { page, json } => {
            let inferences = store.query_inference_table(&page)?;
            if json {
                let payload = build_inference_page_payload(&page, inferences);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_inference_table(&inferences);
            }
        }
        PreparedQuery::InferenceBounds => {
            let bounds = store.query_inference_table_bounds()?;
            let payload = build_bounds_payload("inferences", bounds);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        PreparedQuery::EpisodePage { page, json } => {
            let episodes = store.query_episode_table(&page)?;
            if json {
                let payload = EpisodePagePayload {
                    contract_version: "episode_page.v1".to_string(),
                    page_size: page.page_size,
                    before: page.before,
                    after: page.after,
                    episodes,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_episode_table(&episodes);
            }
        }
        PreparedQuery::EpisodeBounds => {
            let bounds = store.query_episode_table_bounds()?;
            let payload = build_bounds_payload("episodes", bounds);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        PreparedQuery::EpisodeShow { episode_id, json } => {
            let inferences = store.list_inferences_for_episode(episode_id)?;
            if json {
                let payload = EpisodeDetailPayload {
                    contract_version: "episode_detail.v1".to_string(),
                    episode_id,
                    count: store.count_inferences_for_episode(episode_id)?,
                    inferences,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_inference_table(&inferences);
            }
        }
        PreparedQuery::CountInferences {
            function_name,
            shape,
        } => {
            let count = store.count_inferences_for_function(&function_name, &shape)?;
            let payload = build_count_payload("inferences", &function_name, &shape, None, count);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        PreparedQuery::CountFeedback {
            function_name,
            shape,
            metric_name,
            metric,
        } => {
            let count =
                store.count_feedbacks_for_metric(&function_name, &shape, &metric_name, &metric)?;
            let payload = build_count_payload(
                "feedback",
                &function_name,
                &shape,
                Some(&metric_name),
                count,
            );
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        PreparedQuery::CountByVariant {
            function_name,
            shape,
        } => {
            let variants = store.count_inferences_by_variant(&function_name, &shape)?;
            let payload = VariantCountsPayload {
                contract_version: "variant_counts.v1".to_string(),
                function_name,
                function_type: shape.function_type(),
                variants,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        PreparedQuery::CurateCount(request) => {
            let count = store.count_curated_inferences(&request)?;
            let payload = build_count_payload(
                "curated",
                &request.function_name,
                &request.shape,
                request.metric.as_ref().map(|metric| metric.name.as_str()),
                count,
            );
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        PreparedQuery::CurateList { request, json } => {
            let inferences = store.get_curated_inferences(&request)?;
            debug!(selected = inferences.len(), "curated inferences");
            if json {
                let payload = CuratedPayload {
                    contract_version: "curated_inferences.v1".to_string(),
                    function_name: request.function_name.clone(),
                    function_type: request.shape.function_type(),
                    metric_name: request.metric.as_ref().map(|metric| metric.name.clone()),
                    threshold: request.threshold,
                    limit: request.limit,
                    inferences,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_inference_table(&inferences);
            }
        }
        PreparedQuery::Health => {
            let payload = build_health_payload("embedded", store.check_connection(), None);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }
    Ok(())
}

fn run_record(command: RecordCommand, store: &SqliteLedgerStore, config: &LedgerConfig) -> Result<()> {
    match command {
        RecordCommand::Inference(args) => {
            let input = InferenceInput {
                id: args.id.as_deref().map(|raw| parse_id(raw, "--id")).transpose()?,
                shape: resolve_shape(config, &args.function, &args.shape)?,
                function_name: args.function,
                variant_name: args.variant,
                episode_id: parse_id(&args.episode_id, "--episode-id")?,
                input: parse_payload_json(&args.input_json, "--input-json")?,
                output: parse_payload_json(&args.output_json, "--output-json")?,
            };

            let inference = store.append_inference(&input)?;
            println!("{}", serde_json::to_string_pretty(&inference)?);
            Ok(())
        }
        RecordCommand::Feedback(args) => {
            let metric = resolve_metric(config, &args.metric, args.metric_config.as_deref())?;
            let input = FeedbackInput {
                feedback_id: args
                    .feedback_id
                    .as_deref()
                    .map(|raw| parse_id(raw, "--feedback-id"))
                    .transpose()?,
                target_id: parse_id(&args.target_id, "--target-id")?,
                value: parse_feedback_value(metric.kind(), &args.value)?,
                occurred_at: parse_optional_utc(args.occurred_at.as_deref())?,
                metric_name: args.metric,
            };

            let record = store.append_feedback(&input)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

fn run_health(db_path: &Path) -> Result<()> {
    let (connected, error) = match SqliteLedgerStore::open_read_only(db_path) {
        Ok(store) => (store.check_connection(), None),
        Err(err) => (false, Some(format!("{err:#}"))),
    };

    let payload = build_health_payload(&db_path.display().to_string(), connected, error);
    println!("{}", serde_json::to_string_pretty(&payload)?);

    if connected {
        Ok(())
    } else {
        Err(LedgerError::Connectivity(format!(
            "ledger store unavailable at {}",
            db_path.display()
        ))
        .into())
    }
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    // A host may already own the global subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Loads `ledger.toml`; a missing file yields an empty config.
///
/// # Errors
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<LedgerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no ledger config file; using inline arguments only");
        return Ok(LedgerConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ledger config at {}", path.display()))?;
    Ok(LedgerConfig::from_toml_str(&raw)?)
}

fn resolve_shape(config: &LedgerConfig, function_name: &str, args: &ShapeArgs) -> Result<VariantShape> {
    match args.variant_shape.as_deref() {
        Some(raw) => Ok(VariantShape::parse_json(raw)?),
        None => Ok(config.function(function_name)?.clone()),
    }
}

fn resolve_metric(config: &LedgerConfig, metric_name: &str, inline: Option<&str>) -> Result<MetricConfig> {
    match inline {
        Some(raw) => Ok(MetricConfig::parse_json(raw)?),
        None => Ok(*config.metric(metric_name)?),
    }
}

fn curation_request(
    config: &LedgerConfig,
    args: &CurateArgs,
    limit: Option<usize>,
) -> Result<CurationRequest> {
    let metric = match (&args.metric, args.metric_config.as_deref()) {
        (Some(name), inline) => Some(CurationMetric {
            name: name.clone(),
            config: resolve_metric(config, name, inline)?,
        }),
        (None, Some(_)) => {
            return Err(LedgerError::Validation(
                "--metric-config requires --metric".to_string(),
            )
            .into())
        }
        (None, None) => None,
    };

    Ok(CurationRequest {
        function_name: args.function.clone(),
        shape: resolve_shape(config, &args.function, &args.shape)?,
        metric,
        threshold: args.threshold,
        limit,
    })
}

fn page_request(args: &PageArgs) -> Result<PageRequest> {
    Ok(PageRequest {
        before: args
            .before
            .as_deref()
            .map(|raw| parse_id(raw, "--before"))
            .transpose()?,
        after: args
            .after
            .as_deref()
            .map(|raw| parse_id(raw, "--after"))
            .transpose()?,
        page_size: args.page_size,
    })
}

fn parse_id(raw: &str, flag: &str) -> Result<LedgerId> {
    LedgerId::parse(raw).map_err(|err| anyhow::Error::new(err).context(format!("invalid {flag} value")))
}

fn parse_payload_json(raw: &str, flag: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} must be valid JSON: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn parse_feedback_value(kind: MetricKind, raw: &str) -> Result<FeedbackValue> {
    match kind {
        MetricKind::Boolean => raw
            .trim()
            .parse::<bool>()
            .map(FeedbackValue::Boolean)
            .with_context(|| format!("boolean feedback value must be true or false: {raw}")),
        MetricKind::Float => raw
            .trim()
            .parse::<f64>()
            .map(FeedbackValue::Float)
            .with_context(|| format!("float feedback value must be a number: {raw}")),
        MetricKind::Demonstration => parse_payload_json(raw, "--value").map(FeedbackValue::Demonstration),
    }
}

fn print_inference_table(inferences: &[Inference]) {
    println!(
        "{:<26}  {:<24} {:<16} {:<26}  timestamp",
        "id", "function", "variant", "episode_id"
    );
    println!("{}", "-".repeat(122));

    for inference in inferences {
        println!(
            "{:<26}  {:<24} {:<16} {:<26}  {}",
            inference.id,
            inference.function_name,
            inference.variant_name,
            inference.episode_id,
            format_rfc3339(inference.timestamp).unwrap_or_else(|_| "n/a".to_string())
        );
    }
}

fn print_episode_table(episodes: &[Episode]) {
    println!(
        "{:<26}  {:<6} {:<24} {:<24} last_inference_id",
        "episode_id", "count", "start_time", "end_time"
    );
    println!("{}", "-".repeat(112));

    for episode in episodes {
        println!(
            "{:<26}  {:<6} {:<24} {:<24} {}",
            episode.episode_id,
            episode.count,
            format_rfc3339(episode.start_time).unwrap_or_else(|_| "n/a".to_string()),
            format_rfc3339(episode.end_time).unwrap_or_else(|_| "n/a".to_string()),
            episode.last_inference_id
        );
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MigratePayload {
    contract_version: String,
    db: String,
    migrated: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct InferencePagePayload {
    contract_version: String,
    page_size: u32,
    before: Option<LedgerId>,
    after: Option<LedgerId>,
    inferences: Vec<Inference>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct EpisodePagePayload {
    contract_version: String,
    page_size: u32,
    before: Option<LedgerId>,
    after: Option<LedgerId>,
    episodes: Vec<Episode>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct EpisodeDetailPayload {
    contract_version: String,
    episode_id: LedgerId,
    count: u64,
    inferences: Vec<Inference>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct BoundsPayload {
    contract_version: String,
    table: String,
    first_id: Option<LedgerId>,
    last_id: Option<LedgerId>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CountPayload {
    contract_version: String,
    subject: String,
    function_name: String,
    function_type: FunctionType,
    metric_name: Option<String>,
    count: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct VariantCountsPayload {
    contract_version: String,
    function_name: String,
    function_type: FunctionType,
    variants: Vec<VariantCount>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CuratedPayload {
    contract_version: String,
    function_name: String,
    function_type: FunctionType,
    metric_name: Option<String>,
    threshold: f64,
    limit: Option<usize>,
    inferences: Vec<Inference>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthPayload {
    contract_version: String,
    db: String,
    connected: bool,
    error: Option<String>,
}

fn build_inference_page_payload(page: &PageRequest, inferences: Vec<Inference>) -> InferencePagePayload {
    InferencePagePayload {
        contract_version: "inference_page.v1".to_string(),
        page_size: page.page_size,
        before: page.before,
        after: page.after,
        inferences,
    }
}

fn build_bounds_payload(table: &str, bounds: TableBounds) -> BoundsPayload {
    BoundsPayload {
        contract_version: "table_bounds.v1".to_string(),
        table: table.to_string(),
        first_id: bounds.first_id,
        last_id: bounds.last_id,
    }
}

fn build_count_payload(
    subject: &str,
    function_name: &str,
    shape: &VariantShape,
    metric_name: Option<&str>,
    count: u64,
) -> CountPayload {
    CountPayload {
        contract_version: "count.v1".to_string(),
        subject: subject.to_string(),
        function_name: function_name.to_string(),
        function_type: shape.function_type(),
        metric_name: metric_name.map(str::to_string),
        count,
    }
}

fn build_health_payload(db: &str, connected: bool, error: Option<String>) -> HealthPayload {
    HealthPayload {
        contract_version: "health.v1".to_string(),
        db: db.to_string(),
        connected,
        error,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use serde_json::json;
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(std::iter::once("ledger").chain(args.iter().copied()))?;
        run_cli(cli)
    }

    fn temp_path(prefix: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.{extension}", LedgerId::new()))
    }

    fn path_str(path: &Path) -> String {
        match path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp path must be valid UTF-8"),
        }
    }

    fn ledger_error(err: &anyhow::Error) -> &LedgerError {
        match err.downcast_ref::<LedgerError>() {
            Some(value) => value,
            None => panic!("expected LedgerError, got {err:#}"),
        }
    }

    fn fixture_id(raw: &str) -> LedgerId {
        match LedgerId::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture ULID: {err}"),
        }
    }

    #[test]
    fn parse_payload_rejects_invalid_json() {
        assert!(parse_payload_json("{", "--input-json").is_err());
        let value = must(parse_payload_json(r#"{"key":"value"}"#, "--input-json"));
        assert_eq!(value["key"], json!("value"));
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00+02:00")).is_err());
    }

    #[test]
    fn feedback_values_parse_by_metric_kind() {
        assert_eq!(
            must(parse_feedback_value(MetricKind::Boolean, "true")),
            FeedbackValue::Boolean(true)
        );
        assert_eq!(
            must(parse_feedback_value(MetricKind::Float, "0.75")),
            FeedbackValue::Float(0.75)
        );
        assert_eq!(
            must(parse_feedback_value(MetricKind::Demonstration, r#"{"answer":42}"#)),
            FeedbackValue::Demonstration(json!({"answer": 42}))
        );
        assert!(parse_feedback_value(MetricKind::Boolean, "yes").is_err());
        assert!(parse_feedback_value(MetricKind::Float, "high").is_err());
    }

    #[test]
    fn inline_shape_and_metric_win_over_config() {
        let config = must(
            LedgerConfig::from_toml_str(
                r#"
[functions.extract_entities]
type = "json"

[metrics.exact_match]
type = "boolean"
optimize = "max"
level = "inference"
"#,
            )
            .map_err(Into::into),
        );

        let from_config = must(resolve_shape(
            &config,
            "extract_entities",
            &ShapeArgs { variant_shape: None },
        ));
        assert_eq!(from_config.function_type(), FunctionType::Json);

        let inline = must(resolve_shape(
            &config,
            "extract_entities",
            &ShapeArgs {
                variant_shape: Some(r#"{"type":"chat"}"#.to_string()),
            },
        ));
        assert_eq!(inline.function_type(), FunctionType::Chat);

        let metric = must(resolve_metric(
            &config,
            "exact_match",
            Some(r#"{"type":"float","optimize":"min","level":"episode"}"#),
        ));
        assert_eq!(metric.kind(), MetricKind::Float);

        let Err(err) = resolve_metric(&config, "unknown_metric", None) else {
            panic!("expected unknown metric error");
        };
        assert!(matches!(ledger_error(&err), LedgerError::Configuration(_)));
    }

    #[test]
    fn unrecognized_metric_type_is_a_configuration_error() {
        let Err(err) = resolve_metric(
            &LedgerConfig::default(),
            "exact_match",
            Some(r#"{"type":"ranking","level":"inference"}"#),
        ) else {
            panic!("expected configuration error");
        };
        assert!(matches!(ledger_error(&err), LedgerError::Configuration(_)));
    }

    #[test]
    fn missing_config_file_yields_empty_config() {
        let config = must(load_config(&temp_path("ledger-missing-config", "toml")));
        assert_eq!(config, LedgerConfig::default());
    }

    #[test]
    fn bounds_json_contract_is_stable_v1() {
        let payload = build_bounds_payload(
            "episodes",
            TableBounds {
                first_id: Some(fixture_id("01J0SQQP7M70P6Y3R4T8D8G8M2")),
                last_id: None,
            },
        );

        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "table_bounds.v1",
                "table": "episodes",
                "first_id": "01J0SQQP7M70P6Y3R4T8D8G8M2",
                "last_id": null
            })
        );
    }

    #[test]
    fn count_json_contract_is_stable_v1() {
        let payload = build_count_payload(
            "curated",
            "extract_entities",
            &VariantShape::json(),
            Some("exact_match"),
            41,
        );

        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "count.v1",
                "subject": "curated",
                "function_name": "extract_entities",
                "function_type": "json",
                "metric_name": "exact_match",
                "count": 41
            })
        );
    }

    #[test]
    fn both_cursors_fail_before_the_store_is_opened() {
        let db_path = temp_path("ledger-cli-cursors", "sqlite3");
        let db = path_str(&db_path);

        let Err(err) = execute_cli(&[
            "--db",
            &db,
            "inferences",
            "list",
            "--before",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "--after",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
        ]) else {
            panic!("expected cursor validation error");
        };

        assert_eq!(
            ledger_error(&err),
            &LedgerError::Validation("cannot specify both 'before' and 'after' cursors".to_string())
        );
        assert!(!db_path.exists());
    }

    #[test]
    fn query_against_missing_database_is_a_connectivity_error() {
        let db_path = temp_path("ledger-cli-missing", "sqlite3");
        let db = path_str(&db_path);

        let Err(err) = execute_cli(&["--db", &db, "inferences", "bounds"]) else {
            panic!("expected connectivity error");
        };
        assert!(matches!(ledger_error(&err), LedgerError::Connectivity(_)));
        assert!(execute_cli(&["--db", &db, "health"]).is_err());
    }

    #[test]
    fn configuration_errors_win_over_an_unavailable_store() {
        let db_path = temp_path("ledger-cli-config-first", "sqlite3");
        let db = path_str(&db_path);

        let Err(err) = execute_cli(&[
            "--db",
            &db,
            "curate",
            "count",
            "--function",
            "extract_entities",
            "--variant-shape",
            r#"{"type":"json"}"#,
            "--metric",
            "exact_match",
            "--metric-config",
            r#"{"type":"ranking","level":"inference"}"#,
        ]) else {
            panic!("expected configuration error");
        };
        assert!(matches!(ledger_error(&err), LedgerError::Configuration(_)));

        let Err(err) = execute_cli(&[
            "--db",
            &db,
            "count",
            "inferences",
            "--function",
            "write_haiku",
        ]) else {
            panic!("expected unknown function error");
        };
        assert!(matches!(ledger_error(&err), LedgerError::Configuration(_)));

        let Err(err) = execute_cli(&[
            "--db",
            &db,
            "curate",
            "list",
            "--function",
            "extract_entities",
            "--variant-shape",
            r#"{"type":"json"}"#,
            "--metric-config",
            r#"{"type":"boolean","optimize":"max","level":"inference"}"#,
        ]) else {
            panic!("expected validation error");
        };
        assert!(matches!(ledger_error(&err), LedgerError::Validation(_)));
        assert!(!db_path.exists());
    }

    #[test]
    fn cli_end_to_end_record_list_count_and_curate() {
        let db_path = temp_path("ledger-cli-e2e", "sqlite3");
        let config_path = temp_path("ledger-cli-e2e", "toml");
        let db = path_str(&db_path);
        let config = path_str(&config_path);
        must(
            fs::write(
                &config_path,
                r#"
[functions.extract_entities]
type = "json"

[metrics.exact_match]
type = "boolean"
optimize = "max"
level = "inference"
"#,
            )
            .map_err(Into::into),
        );

        must(execute_cli(&["--db", &db, "--config", &config, "migrate"]));

        let ids = [
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "01J0SQQP7M70P6Y3R4T8D8G8M3",
            "01J0SQQP7M70P6Y3R4T8D8G8M4",
        ];
        for id in ids {
            must(execute_cli(&[
                "--db",
                &db,
                "--config",
                &config,
                "record",
                "inference",
                "--function",
                "extract_entities",
                "--variant",
                "gpt",
                "--episode-id",
                "01J0SQQ00000000000000000E1",
                "--id",
                id,
            ]));
        }

        for (target, value, occurred_at) in [
            (ids[0], "true", "2026-02-07T12:00:00Z"),
            (ids[1], "true", "2026-02-07T12:00:00Z"),
            (ids[1], "false", "2026-02-07T12:05:00Z"),
        ] {
            must(execute_cli(&[
                "--db",
                &db,
                "--config",
                &config,
                "record",
                "feedback",
                "--metric",
                "exact_match",
                "--target-id",
                target,
                "--value",
                value,
                "--occurred-at",
                occurred_at,
            ]));
        }

        must(execute_cli(&["--db", &db, "--config", &config, "inferences", "list", "--json"]));
        must(execute_cli(&["--db", &db, "--config", &config, "episodes", "list"]));
        must(execute_cli(&[
            "--db",
            &db,
            "--config",
            &config,
            "episodes",
            "show",
            "--episode-id",
            "01J0SQQ00000000000000000E1",
            "--json",
        ]));
        must(execute_cli(&[
            "--db",
            &db,
            "--config",
            &config,
            "count",
            "by-variant",
            "--function",
            "extract_entities",
        ]));
        must(execute_cli(&[
            "--db",
            &db,
            "--config",
            &config,
            "curate",
            "list",
            "--function",
            "extract_entities",
            "--metric",
            "exact_match",
        ]));
        must(execute_cli(&["--db", &db, "health"]));

        let store = must(SqliteLedgerStore::open_read_only(&db_path));
        let config_model = must(load_config(&config_path));
        let request = must(curation_request(
            &config_model,
            &CurateArgs {
                function: "extract_entities".to_string(),
                shape: ShapeArgs { variant_shape: None },
                metric: Some("exact_match".to_string()),
                metric_config: None,
                threshold: 0.0,
            },
            None,
        ));
        assert_eq!(must(store.count_curated_inferences(&request)), 1);
        assert_eq!(
            must(store.count_inferences_for_function("extract_entities", &VariantShape::json())),
            3
        );
        drop(store);

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&config_path);
    }
}
