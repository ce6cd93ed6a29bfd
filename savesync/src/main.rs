//! Headless savesync agent
//!
//! Mirrors the saved articles of one remoteStorage account into a local data
//! directory and keeps the two in step.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use savesync_core::{
    article::ArticleState,
    confirm::{ChannelConfirmations, ConfirmationAction, ConfirmationKind, StaticConfirmations},
    coordinator::{SyncCoordinator, SyncError, SyncPhase},
    network::{Connectivity, NetworkPolicyGate, Preferences},
    progress::{ProgressPhase, SyncProgress},
    remote::http::{HttpRemoteConfig, RemoteStorageClient},
    store::ArticleStore,
    SyncConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "savesync")]
#[command(about = "Sync saved articles with remoteStorage")]
struct Cli {
    /// Local data directory
    #[arg(long, global = true, env = "SAVESYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the local mirror in sync
    Sync {
        /// `user@host` or a storage URL
        address: String,

        /// OAuth bearer token
        #[arg(long, env = "SAVESYNC_TOKEN", hide_env_values = true)]
        token: String,

        /// Merge articles saved on this device into the account
        #[arg(long, conflicts_with = "replace_with_server")]
        keep_local: bool,

        /// Discard articles saved on this device and take the account's copy
        #[arg(long)]
        replace_with_server: bool,

        /// Sync once and exit
        #[arg(long)]
        once: bool,
    },

    /// Show what the local mirror holds
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List saved articles
    List {
        /// Only articles in this state (unread, archived)
        #[arg(long, value_parser = parse_state)]
        state: Option<ArticleState>,

        #[arg(long)]
        json: bool,
    },

    /// Forget the account and wipe the local mirror
    Disconnect {
        #[arg(long)]
        yes: bool,
    },
}

fn parse_state(s: &str) -> Result<ArticleState, String> {
    ArticleState::parse(s).ok_or_else(|| format!("unknown article state `{s}`"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Sync {
            address,
            token,
            keep_local,
            replace_with_server,
            once,
        } => {
            let answer = if keep_local {
                Some(ConfirmationAction::KeepLocal)
            } else if replace_with_server {
                Some(ConfirmationAction::ReplaceWithServer)
            } else {
                None
            };
            run_sync(&config, &address, &token, answer, once).await?;
        }
        Commands::Status { json } => show_status(&config, json).await?,
        Commands::List { state, json } => list_articles(&config, state, json).await?,
        Commands::Disconnect { yes } => wipe(&config, yes).await?,
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<ArticleStore> {
    ArticleStore::open(&config.data_dir)
        .await
        .with_context(|| format!("opening store at {}", config.data_dir.display()))
}

async fn run_sync(
    config: &SyncConfig,
    address: &str,
    token: &str,
    answer: Option<ConfirmationAction>,
    once: bool,
) -> Result<()> {
    let store = Arc::new(open_store(config).await?);
    let remote = Arc::new(RemoteStorageClient::new(HttpRemoteConfig::from(config))?);
    let network = Arc::new(NetworkPolicyGate::new(
        Preferences {
            sync_enabled: config.sync_enabled,
            wifi_only: config.wifi_only,
        },
        Connectivity::default(),
    ));
    let sync = SyncCoordinator::new(store, remote, network);

    match answer {
        Some(action) => sync
            .confirmations()
            .register_handler(Arc::new(StaticConfirmations(action))),
        None => {
            let (handler, mut requests) = ChannelConfirmations::new(1);
            sync.confirmations().register_handler(Arc::new(handler));
            tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                while let Some(pending) = requests.recv().await {
                    let count = pending.request.article_count;
                    let action = match pending.request.kind {
                        ConfirmationKind::ConnectWithLocalArticles => {
                            println!(
                                "This device has {count} articles. Keep them and merge (k), replace them with the account's articles (r), or cancel?"
                            );
                            match lines.next_line().await {
                                Ok(Some(line)) if line.trim() == "k" => ConfirmationAction::KeepLocal,
                                Ok(Some(line)) if line.trim() == "r" => {
                                    ConfirmationAction::ReplaceWithServer
                                }
                                _ => ConfirmationAction::Cancel,
                            }
                        }
                        ConfirmationKind::Disconnect => {
                            println!("Disconnecting removes {count} local articles. Continue? (y/N)");
                            match lines.next_line().await {
                                Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y") => {
                                    ConfirmationAction::Confirm
                                }
                                _ => ConfirmationAction::Cancel,
                            }
                        }
                    };
                    pending.respond(action);
                }
            });
        }
    }

    let _progress = sync.progress().subscribe(print_progress);

    match sync.connect(address, token).await {
        Ok(()) => {}
        Err(SyncError::Cancelled) => {
            println!("Cancelled, nothing was changed");
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("syncing with {address}")),
    }

    if once {
        let report = sync.flush().await?;
        if report.failed > 0 || report.deferred > 0 {
            warn!(
                "{} changes failed and {} were deferred",
                report.failed, report.deferred
            );
        }
        println!("{} articles in sync", sync.store().len());
        return Ok(());
    }

    info!("Watching for changes, Ctrl-C to stop");
    let mut phase = sync.watch_phase();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *phase.borrow_and_update();
                if let Some(error) = sync.last_error() {
                    bail!("sync stopped in {}: {}", current, error);
                }
                if current == SyncPhase::Disconnected {
                    warn!("Remote session ended");
                    return Ok(());
                }
            }
        }
    }
    let report = sync.flush().await?;
    info!("Stopping after pushing {} pending changes", report.pushed + report.removed);
    Ok(())
}

fn print_progress(progress: &SyncProgress) {
    match progress.phase {
        ProgressPhase::InitialSync | ProgressPhase::Syncing => {
            let failed = if progress.failed_articles > 0 {
                format!(", {} failed", progress.failed_articles)
            } else {
                String::new()
            };
            println!(
                "syncing {}/{}{}",
                progress.processed_articles, progress.total_articles, failed
            );
        }
        ProgressPhase::Ready if progress.failed_articles > 0 => println!(
            "ready: {} articles, {} could not be read",
            progress.total_articles, progress.failed_articles
        ),
        ProgressPhase::Ready => println!("ready: {} articles", progress.total_articles),
        ProgressPhase::Idle => {
            if let Some(message) = &progress.message {
                println!("idle: {message}");
            }
        }
    }
}

async fn show_status(config: &SyncConfig, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let watermark = store.watermark();
    let status = serde_json::json!({
        "dataDir": config.data_dir,
        "articles": store.len(),
        "unread": store.list_by_state(ArticleState::Unread).len(),
        "archived": store.list_by_state(ArticleState::Archived).len(),
        "unsynced": store.unsynced_count(),
        "pendingPushes": store.pending_pushes().len(),
        "pendingRemovals": store.pending_removals().len(),
        "lastFullSync": watermark.last_full_sync_at,
        "diskUsageBytes": store.disk_usage(),
    });
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("data dir:         {}", config.data_dir.display());
    println!("articles:         {}", status["articles"]);
    println!("  unread:         {}", status["unread"]);
    println!("  archived:       {}", status["archived"]);
    println!("never synced:     {}", status["unsynced"]);
    println!(
        "pending:          {} writes, {} removals",
        status["pendingPushes"], status["pendingRemovals"]
    );
    match watermark.last_full_sync_at {
        Some(at) => println!("last full sync:   {}", at.with_timezone(&chrono::Local)),
        None => println!("last full sync:   never"),
    }
    println!("disk usage:       {} bytes", status["diskUsageBytes"]);
    Ok(())
}

async fn list_articles(config: &SyncConfig, state: Option<ArticleState>, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let mut articles = match state {
        Some(state) => store.list_by_state(state),
        None => store.list(),
    };
    articles.sort_by(|a, b| b.ingest_date.cmp(&a.ingest_date));
    if json {
        println!("{}", serde_json::to_string_pretty(&articles)?);
        return Ok(());
    }
    for article in articles {
        println!(
            "{:<9} {}  {}  {}",
            article.state().as_str(),
            article.ingest_date.format("%Y-%m-%d"),
            article.slug(),
            article.title
        );
    }
    Ok(())
}

async fn wipe(config: &SyncConfig, yes: bool) -> Result<()> {
    if !yes {
        bail!("disconnecting deletes the local mirror; pass --yes to confirm");
    }
    let store = open_store(config).await?;
    let count = store.len();
    store.clear().await?;
    store.reset_watermark().await?;
    println!("Removed {count} local articles");
    Ok(())
}
