use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gwd_adapters::load_submission_file;
use gwd_core::GameweekKind;
use gwd_storage::PgStore;
use gwd_sync::{DigestConfig, DigestRuntime, LeagueRegistry};
use tracing::{info, Level};

#[derive(Debug, Parser)]
#[command(name = "gwd-cli")]
#[command(about = "Gameweek digest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the digest scheduler when enabled).
    Serve,
    Migrate,
    /// Ingest one snapshot file.
    Ingest {
        #[arg(long)]
        mode: GameweekKind,
        path: PathBuf,
    },
    /// Print a digest for a league.
    Digest {
        league_id: i64,
        #[arg(long)]
        gameweek: Option<i32>,
        #[arg(long)]
        structured: bool,
    },
    /// Push digests to the configured webhook.
    Notify {
        league_id: Option<i64>,
        #[arg(long)]
        gameweek: Option<i32>,
        #[arg(long)]
        all: bool,
    },
}

fn init_tracing() {
    let level = std::env::var("GWD_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn connect(config: &DigestConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.db_max_connections).await
}

async fn runtime(config: DigestConfig) -> Result<DigestRuntime> {
    let store = connect(&config).await?;
    DigestRuntime::new(config, Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = DigestConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = runtime(config).await?;
            let scheduler = runtime.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %runtime.config.digest_cron, "digest scheduler started");
            }
            gwd_web::serve(&runtime).await?;
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Ingest { mode, path } => {
            let runtime = runtime(config).await?;
            let submission = load_submission_file(mode, &path)?;
            let summary = runtime.pipeline.ingest(submission).await?;
            println!(
                "ingest complete: league_id={} gameweek={} teams={} players={} matches={} dropped={} delivery={:?}",
                summary.league_id,
                summary.gameweek,
                summary.teams,
                summary.players,
                summary.matches,
                summary.dropped_matches,
                summary.delivery
            );
        }
        Commands::Digest {
            league_id,
            gameweek,
            structured,
        } => {
            let runtime = runtime(config).await?;
            if structured {
                let envelope = runtime.digests.envelope(league_id, gameweek).await?;
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else {
                println!("{}", runtime.digests.text(league_id, gameweek).await?);
            }
        }
        Commands::Notify {
            league_id,
            gameweek,
            all,
        } => {
            let runtime = runtime(config).await?;
            let Some(notifier) = runtime.notifier.clone() else {
                bail!("GWD_WEBHOOK_URL is not set");
            };
            if all {
                let registry =
                    LeagueRegistry::from_workspace_root(&runtime.config.workspace_root).await?;
                let outcomes = notifier.notify_leagues(&registry.enabled_ids()).await;
                for (league_id, outcome) in outcomes {
                    match outcome {
                        Ok(()) => println!("league {league_id}: delivered"),
                        Err(err) => println!("league {league_id}: {err}"),
                    }
                }
            } else {
                let league_id = league_id.context("league_id is required unless --all is set")?;
                notifier.notify(league_id, gameweek).await?;
                println!("league {league_id}: delivered to {}", notifier.url());
            }
        }
    }

    Ok(())
}
