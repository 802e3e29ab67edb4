use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use profile_harvest::config::HarvestConfig;
use profile_harvest::database_ops::checkpoint::CheckpointStore;
use profile_harvest::database_ops::db::Db;
use profile_harvest::database_ops::documents::DocumentDir;
use profile_harvest::database_ops::error_log::ErrorLog;
use profile_harvest::database_ops::export::{export_profiles, ExportFormat, ExportLayout, ExportOptions};
use profile_harvest::logging::{init_tracing, DEFAULT_FILTER};
use profile_harvest::orchestrator::{plan_run, Harvester};
use profile_harvest::util::env;
use profile_harvest::wiki::harvest::{count_wiki_errors, count_wiki_processed, WikiHarvester};

#[derive(Parser, Debug)]
#[command(name = "harvest", version, about = "Resumable personality-profile harvester")]
struct Cli {
    /// Config file (defaults to ./config.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging for this crate
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Fetch profiles, typing breakdowns and comment threads for a range of ids
    Run {
        /// First id of the range (default: one past the highest processed id)
        #[arg(long)]
        start_id: Option<i64>,
        /// Number of ids to enumerate
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        workers: Option<usize>,
        /// Also retry ids below the range that failed earlier
        #[arg(long, default_value_t = false)]
        retry_failed: bool,
    },
    /// Fetch encyclopedia pages for stored public figures and characters
    Wiki {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Write stored profiles and their typing breakdowns to a file
    Export {
        #[arg(long, default_value = "typing_breakdown.csv")]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = ExportLayout::Votes)]
        layout: ExportLayout,
        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
        #[arg(long, default_value_t = false)]
        include_wiki: bool,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Print checkpoint and error counts
    Status,
}

/// Ctrl-C stops dispatch; work already in flight finishes normally.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            trigger.cancel();
        }
    });
    token
}

async fn open_db(cfg: &HarvestConfig, workers: usize) -> Result<Db> {
    let default_conns = u32::try_from(workers + 1).unwrap_or(u32::MAX);
    let max_conns = env::env_parse("HARVEST_DB_MAX_CONNECTIONS", default_conns);
    Db::connect(&cfg.db_path, max_conns)
        .await
        .with_context(|| format!("failed to open database {}", cfg.db_path.display()))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env::init_env();
    let cli = Cli::parse();
    init_tracing(DEFAULT_FILTER, cli.verbose || env::env_flag("HARVEST_VERBOSE", false))?;

    let mut cfg = HarvestConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            start_id,
            count,
            workers,
            retry_failed,
        } => {
            if start_id.is_some() {
                cfg.start_id = start_id;
            }
            if let Some(n) = count {
                cfg.num_profiles_to_scrape = n;
            }
            if let Some(w) = workers {
                cfg.max_workers = w;
            }
            cfg.retry_failed |= retry_failed;
            cfg.validate()?;
            cfg.log_summary();

            let db = open_db(&cfg, cfg.max_workers).await?;
            let ids = plan_run(&cfg, &db, &db).await.context("failed to plan run")?;
            let harvester = Harvester::from_config(&cfg, db.clone())?;
            let summary = harvester.run(ids, cancel_on_ctrl_c()).await;
            for (kind, n) in &summary.failures {
                info!(kind = %kind, count = n, "failures by kind");
            }
            db.close().await;
        }
        Commands::Wiki { workers } => {
            if let Some(w) = workers {
                cfg.wiki_max_workers = w;
            }
            cfg.validate()?;
            let db = open_db(&cfg, cfg.wiki_max_workers).await?;
            let harvester = WikiHarvester::from_config(&cfg, db.clone())?;
            harvester
                .run(cancel_on_ctrl_c())
                .await
                .context("encyclopedia harvest failed")?;
            db.close().await;
        }
        Commands::Export {
            out,
            layout,
            format,
            include_wiki,
            limit,
        } => {
            let db = open_db(&cfg, 1).await?;
            let opts = ExportOptions {
                layout,
                format,
                include_wiki,
                limit,
            };
            export_profiles(&db, &DocumentDir::new(&cfg.data_dir), &out, &opts).await?;
            db.close().await;
        }
        Commands::Status => {
            let db = open_db(&cfg, 1).await?;
            let processed = db.count_complete().await?;
            let highest = db.highest_complete().await?;
            let errors = ErrorLog::count(&db).await?;
            let wiki_done = count_wiki_processed(&db).await?;
            let wiki_errors = count_wiki_errors(&db).await?;
            println!("database:           {}", cfg.db_path.display());
            println!("processed profiles: {processed}");
            println!(
                "highest processed:  {}",
                highest.map_or_else(|| "-".to_string(), |id| id.to_string())
            );
            println!("error entries:      {errors}");
            println!("wiki processed:     {wiki_done}");
            println!("wiki errors:        {wiki_errors}");
            db.close().await;
        }
    }
    Ok(())
}
