use anyhow::{Context, Result};
use chrono::{Duration as DateDuration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;

use tidemark::backfill::Importer;
use tidemark::bluesky::{GraphSource, PublicGraphSource};
use tidemark::config::Config;
use tidemark::context::AppContext;
use tidemark::db::models::{RelationKind, RunStatus};
use tidemark::output::terminal;
use tidemark::pipeline::{collect, reconcile};

/// Tidemark: follower and engagement history for a Bluesky account.
///
/// Takes a daily snapshot of who follows you, who you follow, mute and
/// block lists, diffs each day against the last, flags removals that look
/// forced rather than organic, and scores engagement on your posts. Your
/// repository export can be merged in to fill the history before tracking
/// began.
#[derive(Parser)]
#[command(name = "tidemark", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run one collection cycle now
    Collect,

    /// Run a collection cycle on a schedule until interrupted
    Watch {
        /// Hours between cycles (default: TIDEMARK_COLLECT_INTERVAL_HOURS)
        #[arg(long)]
        hours: Option<u64>,
    },

    /// Merge a repository archive (CAR file) into the history
    Backfill {
        /// Path to the archive
        path: Option<PathBuf>,

        /// Download your repository from your PDS instead
        #[arg(long, conflicts_with = "path")]
        download: bool,

        /// Stop after this many merge batches; re-run to continue
        #[arg(long)]
        max_batches: Option<usize>,
    },

    /// Show follow/unfollow/mute/block changes
    Changes {
        /// First date to include (YYYY-MM-DD, default: 30 days ago)
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Only one relation: followers, following, muted or blocked
        #[arg(long)]
        kind: Option<RelationKind>,
    },

    /// Show follower removals classified as blocks, mutes or suspected hides
    Hidden {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Show daily reported vs visible counts and net follower change
    Counts {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Show daily engagement rollups
    Rollups {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },

    /// Rank the accounts that interacted with you most
    Top {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Number of accounts to show (default: 20)
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// List archive import runs
    Runs,

    /// Show likes, reposts and replies you gave to others
    Balance,

    /// Show one-sided relationships from the latest snapshots
    Mutuals,

    /// Recompute events, classifications and rollups for every stored date
    Rebuild,

    /// Show system status (last collection, snapshot sizes, last import)
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tidemark=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Init => {
            info!("Initializing tidemark database...");
            let db = tidemark::db::initialize_sqlite(&config.db_path)?;
            let table_count = db.table_count().await?;
            println!("Database initialized at: {}", config.db_path);
            println!("Tables created: {table_count}");
            println!("\nNext: set BLUESKY_HANDLE in your .env file, then run `tidemark collect`.");
        }

        Commands::Collect => {
            config.require_bluesky()?;
            let ctx = open_context(config)?;
            let source = PublicGraphSource::new(&ctx.config.public_api_url)?;

            println!("Collecting snapshots for @{}...", ctx.config.bluesky_handle);
            let report = collect::run_cycle(&ctx, &source, Utc::now().date_naive()).await?;
            terminal::display_cycle(&report);
        }

        Commands::Watch { hours } => {
            config.require_bluesky()?;
            let hours = hours.unwrap_or(config.collect_interval_hours).max(1);
            let ctx = open_context(config)?;
            let source = PublicGraphSource::new(&ctx.config.public_api_url)?;

            println!("Collecting every {hours}h. Press Ctrl-C to stop.");
            tokio::select! {
                result = collect::watch(&ctx, &source, Duration::from_secs(hours * 3600)) => result?,
                _ = tokio::signal::ctrl_c() => println!("\nStopping."),
            }
        }

        Commands::Backfill {
            path,
            download,
            max_batches,
        } => {
            let ctx = open_context(config)?;

            let (archive, repo_did) = if download {
                ctx.config.require_bluesky()?;
                let (path, did) = download_archive(&ctx).await?;
                (path, Some(did))
            } else {
                let path = path.context("Pass an archive path, or --download to fetch your repository")?;
                (path, None)
            };

            let mut importer = Importer::new(ctx.clone()).with_progress(true);
            if let Some(did) = repo_did {
                importer = importer.with_repo_did(did);
            }
            if let Some(n) = max_batches {
                importer = importer.stop_after_batches(n);
            }

            let cancel = importer.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nCancelling after the current batch...");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            println!("Importing {}...", archive.display());
            let run = importer.run(&archive).await?;
            terminal::display_run(&run);

            match run.status {
                RunStatus::Completed => println!("{}", "Import complete.".bold()),
                RunStatus::Partial => println!(
                    "{} {} records could not be recovered; everything else was merged.",
                    "Partial import:".yellow(),
                    run.unrecoverable_records
                ),
                RunStatus::Skipped => println!("This archive was already imported. Nothing to do."),
                RunStatus::Cancelled => {
                    println!("Import cancelled. Re-run the same command to resume; merged rows are kept.")
                }
                RunStatus::Failed => anyhow::bail!(
                    "Import failed: {}",
                    run.error.as_deref().unwrap_or("unknown error")
                ),
                RunStatus::Running => {}
            }
        }

        Commands::Changes { since, kind } => {
            let ctx = open_context(config)?;
            let since = since.unwrap_or_else(|| default_range(None, None).0);
            let events = ctx.db.get_changes_since(since, kind).await?;
            terminal::display_changes(&events);
        }

        Commands::Hidden { from, to } => {
            let ctx = open_context(config)?;
            let (from, to) = default_range(from, to);
            let records = ctx.db.get_hidden_accounts(from, to).await?;
            terminal::display_hidden(&records);
        }

        Commands::Counts { from, to } => {
            let ctx = open_context(config)?;
            let (from, to) = default_range(from, to);
            let rows = ctx.db.get_daily_counts(from, to).await?;
            let velocity = ctx.db.get_follower_velocity(from, to).await?;
            if rows.is_empty() {
                println!("No counts recorded in this range.");
            }
            terminal::display_daily_counts(&rows, &velocity);
        }

        Commands::Rollups { from, to } => {
            let ctx = open_context(config)?;
            let (from, to) = default_range(from, to);
            let rollups = ctx.db.get_rollups(from, to).await?;
            terminal::display_rollups(&rollups);
        }

        Commands::Top { from, to, limit } => {
            let ctx = open_context(config)?;
            let (from, to) = default_range(from, to);
            let top =
                tidemark::engagement::interactions::top_interactors(ctx.db.as_ref(), from, to, limit)
                    .await?;
            terminal::display_top_interactors(&top);
        }

        Commands::Runs => {
            let ctx = open_context(config)?;
            let runs = ctx.db.list_backfill_runs().await?;
            terminal::display_runs(&runs);
        }

        Commands::Balance => {
            let ctx = open_context(config)?;
            let did = match ctx.db.get_scan_state("tracked_did").await? {
                Some(did) => did,
                None => {
                    ctx.config.require_bluesky()?;
                    let source = PublicGraphSource::new(&ctx.config.public_api_url)?;
                    source.resolve_did(&ctx.config.bluesky_handle).await?
                }
            };
            let balance = ctx.db.engagement_balance(&did).await?;
            terminal::display_balance(&balance);
        }

        Commands::Mutuals => {
            let ctx = open_context(config)?;
            let not_back = ctx.db.get_non_mutual_following().await?;
            let fans = ctx.db.get_followers_only().await?;
            terminal::display_members("You follow, they don't follow back", &not_back);
            terminal::display_members("They follow, you don't follow back", &fans);
        }

        Commands::Rebuild => {
            let ctx = open_context(config)?;
            let _append = ctx.locks.append_exclusive().await;
            let summary = reconcile::rebuild_all(ctx.db.as_ref()).await?;
            terminal::display_reconcile(&summary);
        }

        Commands::Status => {
            let db_exists = Path::new(&config.db_path).exists();
            let db = if db_exists {
                tidemark::db::open_sqlite(&config.db_path)?
            } else {
                tidemark::db::in_memory()?
            };
            let ctx = AppContext::new(config, db);
            tidemark::status::show(&ctx).await?;
        }
    }

    Ok(())
}

fn open_context(config: Config) -> Result<AppContext> {
    let db = tidemark::db::open_sqlite(&config.db_path)?;
    Ok(AppContext::new(config, db))
}

/// Fill in a date range, defaulting to the last 30 days.
fn default_range(from: Option<NaiveDate>, to: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
    let to = to.unwrap_or_else(|| Utc::now().date_naive());
    let from = from.unwrap_or(to - DateDuration::days(30));
    (from, to)
}

/// Download the tracked account's repository next to the database.
/// Returns the archive path and the account's DID.
async fn download_archive(ctx: &AppContext) -> Result<(PathBuf, String)> {
    let source = PublicGraphSource::new(&ctx.config.public_api_url)?;
    let did = source.resolve_did(&ctx.config.bluesky_handle).await?;
    let pds = source.pds(&did).await?;

    let dir = Path::new(&ctx.config.db_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("archives");
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let dest = dir.join(format!(
        "{}-{}.car",
        did.replace(':', "_"),
        Utc::now().format("%Y%m%d%H%M%S")
    ));

    println!("Downloading repository for {} from {}...", did, pds.base_url());
    let bytes = pds.download_repo(&did, &dest).await?;
    println!("  {} bytes saved to {}", bytes, dest.display());
    Ok((dest, did))
}
