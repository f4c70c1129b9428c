//! Embeddable feed ranking command surface.
//!
//! Hosts embed the ranking CLI through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_feed`] for a `FeedCommand` against item snapshots on disk.
//! - [`run_weights`] for inspecting the effective weights ruleset.
//!
//! Engine validation failures keep their [`RankingError`] type inside the
//! returned [`anyhow::Error`]; [`render_error`] turns them into the
//! `{code, message}` envelope.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use stem_ranking_core::{
    parse_rfc3339_utc, Clock, Item, RankingEngine, RankingError, RankingWeights, RawFeedQuery,
    SystemClock,
};
use time::OffsetDateTime;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "STEM_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "stem")]
#[command(about = "Stem feed ranking CLI")]
pub struct Cli {
    /// Tracing filter directive, e.g. `debug` or `stem_ranking_core=debug`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Feed {
        #[command(subcommand)]
        command: Box<FeedCommand>,
    },
    Weights {
        #[command(subcommand)]
        command: Box<WeightsCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum FeedCommand {
    Query(FeedQueryArgs),
    Score(FeedScoreArgs),
}

#[derive(Debug, Args)]
pub struct FeedQueryArgs {
    #[arg(long)]
    items: PathBuf,
    #[arg(long)]
    sort: Option<String>,
    #[arg(long)]
    time_range: Option<String>,
    #[arg(long)]
    tags: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    page: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    limit: Option<String>,
    #[arg(long)]
    now: Option<String>,
    #[arg(long)]
    weights: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct FeedScoreArgs {
    #[arg(long)]
    items: PathBuf,
    #[arg(long)]
    now: Option<String>,
    #[arg(long)]
    weights: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum WeightsCommand {
    Show(WeightsShowArgs),
}

#[derive(Debug, Args)]
pub struct WeightsShowArgs {
    #[arg(long)]
    weights: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRow {
    pub id: String,
    pub trending_score: f64,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when loading inputs fails or the engine rejects the query.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Command::Feed { command } => run_feed(*command),
        Command::Weights { command } => run_weights(*command),
    }
}

/// Executes a parsed feed command and prints its JSON result to stdout.
///
/// # Errors
/// Returns an error when the item snapshot or weights cannot be loaded,
/// `--now` is malformed, or the engine rejects the query parameters.
pub fn run_feed(command: FeedCommand) -> Result<()> {
    match command {
        FeedCommand::Query(args) => {
            let raw = RawFeedQuery {
                page: args.page,
                limit: args.limit,
                sort: args.sort,
                time_range: args.time_range,
                tags: args.tags,
            };
            // Parameters are checked before touching the snapshot on disk.
            let query = raw.validate()?;
            let now = resolve_now(args.now.as_deref(), &SystemClock)?;
            let engine = RankingEngine::new(load_weights(args.weights.as_deref())?)?;
            let items = load_items(&args.items)?;

            let page = engine.query(&items, &query, now)?;
            info!(
                items = items.len(),
                returned = page.data.len(),
                total_count = page.pagination.total_count,
                "feed query complete"
            );
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        FeedCommand::Score(args) => {
            let now = resolve_now(args.now.as_deref(), &SystemClock)?;
            let engine = RankingEngine::new(load_weights(args.weights.as_deref())?)?;
            let items = load_items(&args.items)?;
            let rows = score_rows(&engine, &items, now);

            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_score_table(&rows);
            }
            Ok(())
        }
    }
}

/// Prints the effective weights ruleset.
///
/// # Errors
/// Returns an error when a weights file is given but cannot be loaded.
pub fn run_weights(command: WeightsCommand) -> Result<()> {
    match command {
        WeightsCommand::Show(args) => {
            let weights = load_weights(args.weights.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&weights)?);
            Ok(())
        }
    }
}

/// Reads a JSON array of items and validates each one.
///
/// # Errors
/// Returns an error when the file is unreadable, not a JSON item array, or
/// any item violates the metrics invariants.
pub fn load_items(path: &Path) -> Result<Vec<Item>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading items from {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("items file {} must be valid JSON", path.display()))?;
    let Some(entries) = value.as_array() else {
        anyhow::bail!("items file {} must be a JSON array of items", path.display());
    };

    let items = entries
        .iter()
        .map(Item::from_json)
        .collect::<Result<Vec<Item>, RankingError>>()?;

    debug!(count = items.len(), path = %path.display(), "loaded item snapshot");
    Ok(items)
}

/// Loads a weights ruleset file, or the `v1` defaults when no path is given.
///
/// # Errors
/// Returns an error when the file is unreadable or fails ruleset validation.
pub fn load_weights(path: Option<&Path>) -> Result<RankingWeights> {
    let Some(path) = path else {
        return Ok(RankingWeights::v1());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading weights from {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("weights file {} must be valid JSON", path.display()))?;
    Ok(RankingWeights::from_json(&value)?)
}

/// Renders a failure for stderr along with its process exit code.
///
/// Engine errors become a one-line JSON envelope with exit code 2; anything
/// else is printed as a plain message with exit code 1.
#[must_use]
pub fn render_error(err: &anyhow::Error) -> (String, u8) {
    match err.downcast_ref::<RankingError>() {
        Some(ranking) => {
            let rendered = serde_json::to_string(&ranking.envelope())
                .unwrap_or_else(|_| format!("{}: {ranking}", ranking.code()));
            (rendered, 2)
        }
        None => (format!("error: {err:#}"), 1),
    }
}

fn init_tracing(directive: Option<&str>) -> Result<()> {
    let filter = match directive {
        Some(value) => EnvFilter::try_new(value)
            .with_context(|| format!("invalid --log-level directive `{value}`"))?,
        None => EnvFilter::try_from_env(LOG_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    // A host may already own the global subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

fn resolve_now(raw: Option<&str>, clock: &impl Clock) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => Ok(parse_rfc3339_utc(value)?),
        None => Ok(clock.now()),
    }
}

fn score_rows(engine: &RankingEngine, items: &[Item], now: OffsetDateTime) -> Vec<ScoreRow> {
    items
        .iter()
        .map(|item| ScoreRow {
            id: item.id.clone(),
            trending_score: engine.score(&item.metrics, now),
        })
        .collect()
}

fn print_score_table(rows: &[ScoreRow]) {
    println!("{:<32} trending_score", "id");
    println!("{}", "-".repeat(48));

    for row in rows {
        println!("{:<32} {:.3}", row.id, row.trending_score);
    }
}
