use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use feedfan::{Config, Filter, PageRequest, Scheduler, Syncer};

#[derive(Parser, Debug)]
#[command(name = "feedfan", version, about = "Multi-owner RSS/Atom sync engine")]
struct Args {
    /// Config file (TOML); missing file means defaults
    #[arg(long, value_name = "FILE", default_value = "feedfan.toml")]
    config: PathBuf,

    /// Override the database path from the config file
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scheduled sync passes until Ctrl-C
    Serve,
    /// Run one batch pass over every enabled subscription
    SyncAll,
    /// Sync one owner's subscriptions now
    SyncOwner { owner: String },
    /// Subscribe an owner to a feed
    Add {
        owner: String,
        url: String,
        /// Display title (defaults to the feed's title)
        #[arg(long)]
        title: Option<String>,
    },
    /// List an owner's entries, newest first
    Entries {
        owner: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
        /// Substring match on title and summary
        #[arg(long)]
        search: Option<String>,
        /// Only unread entries
        #[arg(long)]
        unread: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let syncer = Syncer::open(&config)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;

    match args.command {
        Command::Serve => serve(Arc::new(syncer), &config).await?,
        Command::SyncAll => {
            let report = syncer.sync_all().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::SyncOwner { owner } => {
            let results = syncer
                .sync_owner(&owner)
                .await
                .context("Failed to sync owner")?;
            for sync in results {
                match sync.result {
                    Ok(fan_out) => println!(
                        "ok    {} {} (+{} entries)",
                        sync.subscription_id, sync.url, fan_out.inserted
                    ),
                    Err(e) => println!("error {} {}: {}", sync.subscription_id, sync.url, e),
                }
            }
        }
        Command::Add { owner, url, title } => {
            let subscription = syncer
                .add_subscription(&owner, &url, title.as_deref())
                .await
                .with_context(|| format!("Failed to subscribe to {}", url))?;
            println!("{}", serde_json::to_string_pretty(&subscription)?);
        }
        Command::Entries {
            owner,
            page,
            page_size,
            search,
            unread,
        } => {
            let mut filter = Filter::new();
            if let Some(needle) = search.as_deref() {
                filter = filter.contains(&["title", "summary"], needle);
            }
            if unread {
                filter = filter.flag("is_read", false);
            }
            let page = syncer
                .list_entries(&owner, filter, &PageRequest::new(page, page_size))
                .await
                .context("Failed to list entries")?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }

    Ok(())
}

async fn serve(syncer: Arc<Syncer>, config: &Config) -> Result<()> {
    let scheduler = Arc::new(Scheduler::new(syncer, config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    // The runner may already be gone if it panicked
    let _ = shutdown_tx.send(true);
    runner.await.context("Scheduler task failed")?;
    Ok(())
}
