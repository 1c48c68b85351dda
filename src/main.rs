//! `lit-harvest` command line

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use lit_harvest::storage::{DedupMode, DedupStrategy};
use lit_harvest::{logging, BatchOrchestrator, HarvestConfig, HarvestError, RecordStore, ResultCache};

#[derive(Parser)]
#[command(name = "lit-harvest")]
#[command(about = "Harvest PubMed, PMC and OpenAlex records for a literature review")]
struct Cli {
    /// JSON settings file (defaults to the per-user data directory)
    #[arg(long, global = true, env = "LIT_HARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collection for one query
    Collect {
        /// Query text; use --query-file for long queries
        query: Option<String>,

        #[arg(long, conflicts_with = "query")]
        query_file: Option<PathBuf>,

        #[arg(long)]
        max_results: Option<usize>,

        #[arg(long)]
        description: Option<String>,

        /// Re-fetch stored records that lack an abstract or full text
        #[arg(long)]
        enrich_existing: bool,

        /// Ignore and do not update the query cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Run a collection for a file of DOIs, one per line
    CollectDois {
        file: PathBuf,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        enrich_existing: bool,
    },

    /// Resolve records sharing a DOI
    Dedupe {
        /// keep-recent, keep-most-complete, merge or export
        #[arg(long, default_value = "keep-most-complete")]
        strategy: String,

        /// Apply changes instead of previewing them
        #[arg(long)]
        apply: bool,

        /// Where export writes its JSON (defaults to the data directory)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Inspect or clear the query cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print store statistics and recent runs
    Stats {
        #[arg(long, default_value_t = 10)]
        runs: i64,
    },

    /// Fold the records of another store into this one
    Merge {
        /// Database file to read from; it is not modified
        source: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Info,
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match HarvestConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = dir;
    }

    let _guard = match logging::init(&config.log_dir(), cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = execute(cli.command, config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn execute(command: Commands, mut config: HarvestConfig) -> Result<(), HarvestError> {
    match command {
        Commands::Collect {
            query,
            query_file,
            max_results,
            description,
            enrich_existing,
            no_cache,
        } => {
            let query = match (query, query_file) {
                (Some(q), _) => q,
                (None, Some(path)) => std::fs::read_to_string(&path)?,
                (None, None) => {
                    return Err(HarvestError::Config("a query or --query-file is required".into()))
                }
            };
            let query = query.trim().to_string();
            if query.is_empty() {
                return Err(HarvestError::Config("query is empty".into()));
            }

            config.run.enrich_existing |= enrich_existing;
            if no_cache {
                config.search.use_cache = false;
            }
            info!("Database: {}", config.database_path().display());

            let orchestrator = BatchOrchestrator::from_config(config)?;
            let report = orchestrator
                .run(&query, max_results, description.as_deref())
                .await?;
            println!("{}", report.summary());
        }

        Commands::CollectDois {
            file,
            description,
            enrich_existing,
        } => {
            let dois: Vec<String> = std::fs::read_to_string(&file)?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
            if dois.is_empty() {
                return Err(HarvestError::Config(format!("no DOIs in {}", file.display())));
            }

            config.run.enrich_existing |= enrich_existing;
            let orchestrator = BatchOrchestrator::from_config(config)?;
            let report = orchestrator.run_from_dois(&dois, description.as_deref()).await?;
            println!("{}", report.summary());
            for doi in &report.unresolved {
                println!("  not found: {}", doi);
            }
        }

        Commands::Dedupe { strategy, apply, output } => {
            let strategy = DedupStrategy::from_str(&strategy).ok_or_else(|| {
                HarvestError::Config(format!("unknown dedupe strategy: {}", strategy))
            })?;
            let store = RecordStore::open(&config.database_path())?;

            if strategy == DedupStrategy::ExportForReview {
                let path = output.unwrap_or_else(|| config.duplicates_export_path());
                let groups = store.export_duplicates(&path)?;
                println!("Exported {} duplicate groups to {}", groups, path.display());
                return Ok(());
            }

            let mode = if apply { DedupMode::Apply } else { DedupMode::DryRun };
            let report = store.resolve_duplicates(strategy, mode)?;
            for plan in &report.plans {
                println!(
                    "{}: keep {} remove [{}]",
                    plan.secondary_id,
                    plan.keep.as_deref().unwrap_or("-"),
                    plan.remove.join(", ")
                );
            }
            let verb = if apply { "Removed" } else { "Would remove" };
            println!(
                "{} {} records across {} groups ({})",
                verb,
                report.records_removed,
                report.groups,
                strategy.as_str()
            );
        }

        Commands::Cache { action } => {
            let cache = ResultCache::open(config.cache_path());
            match action {
                CacheAction::Info => {
                    let info = cache.info();
                    println!("Cache file: {}", info.path.display());
                    println!("Entries:    {}", info.entries);
                    println!("Total ids:  {}", info.total_ids);
                    if let (Some(oldest), Some(newest)) = (info.oldest, info.newest) {
                        println!("Oldest:     {}", oldest.to_rfc3339());
                        println!("Newest:     {}", newest.to_rfc3339());
                    }
                }
                CacheAction::Clear => {
                    let removed = cache.clear()?;
                    println!("Cleared {} cached queries", removed);
                }
            }
        }

        Commands::Stats { runs } => {
            let store = RecordStore::open(&config.database_path())?;
            let stats = store.statistics()?;
            println!("Records:            {}", stats.total_records);
            println!("  with full text:   {}", stats.with_full_text);
            println!("  with abstract:    {}", stats.with_abstract);
            println!("  with enrichment:  {}", stats.with_enrichment);
            println!("Distinct DOIs:      {}", stats.distinct_secondary_ids);
            println!("Duplicate groups:   {}", stats.duplicate_groups);
            println!("Incomplete entries: {}", stats.incomplete_entries);
            println!("Runs:               {}", stats.runs);

            for (run, status) in store.list_runs(runs)? {
                let counters = store
                    .run_statistics(run.id)?
                    .map(|(s, _)| {
                        format!(
                            "found {}, processed {}, skipped {}, incomplete {}, failed {}",
                            s.found, s.processed, s.skipped, s.incomplete, s.failed
                        )
                    })
                    .unwrap_or_default();
                println!(
                    "#{} {} [{}] {}: {} ({} records)",
                    run.id,
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    status.as_str(),
                    run.description.as_deref().unwrap_or(""),
                    counters,
                    store.count_for_run(run.id)?
                );
            }
        }
        Commands::Merge { source } => {
            let store = RecordStore::open(&config.database_path())?;
            let report = store.merge_from(&source)?;
            println!("{} records inserted, {} merged", report.inserted, report.merged);
        }
    }
    Ok(())
}
