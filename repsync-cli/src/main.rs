use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use repsync_core::config::Config;
use repsync_core::conflict::{ConflictResolution, ResolutionReport};
use repsync_core::flush::FlushOutcome;
use repsync_core::invalidation::InvalidationCoordinator;
use repsync_core::logging::{init_logging_with_config, LogLevel};
use repsync_core::queue::{EntityKind, EntityRef, ItemType, QueueStore, WriteIntent};
use repsync_core::remote::HttpRemote;
use repsync_core::trigger::{Environment, PollingEnvironment};
use repsync_core::{metrics, SyncSession};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "repsync")]
#[command(author, version, about = "Offline write queue for the workout sync service", long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Queue file, overrides the configured path
    #[arg(short, long)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a write intent
    Enqueue {
        /// Entity kind (workout, template, exercise, body_metric, settings)
        #[arg(long)]
        kind: String,

        /// Entity id
        #[arg(long)]
        id: String,

        /// Entity body as JSON
        #[arg(long, default_value = "{}")]
        data: String,

        /// Remote version the edit is based on (RFC 3339)
        #[arg(long)]
        base: Option<String>,

        /// Queue a delete instead of a save
        #[arg(long)]
        delete: bool,
    },

    /// Show queued items, oldest first
    List {
        #[arg(long)]
        json: bool,
    },

    /// Summarize the queue
    Status,

    /// Run one flush pass against a remote
    Flush {
        /// Remote base URL, overrides the configured one
        #[arg(long)]
        remote: Option<String>,

        /// What to do with conflicts found during the pass
        #[arg(long, value_enum, default_value_t = OnConflict::Keep)]
        on_conflict: OnConflict,
    },

    /// Flush on connectivity changes and on an interval until Ctrl-C
    Run {
        #[arg(long)]
        remote: Option<String>,

        /// What to do with conflicts as they are found
        #[arg(long, value_enum, default_value_t = OnConflict::Keep)]
        on_conflict: OnConflict,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OnConflict {
    /// Leave conflicting items queued
    Keep,
    Local,
    Remote,
    Merge,
}

impl OnConflict {
    fn resolution(self) -> Option<ConflictResolution> {
        match self {
            OnConflict::Keep => None,
            OnConflict::Local => Some(ConflictResolution::Local),
            OnConflict::Remote => Some(ConflictResolution::Remote),
            OnConflict::Merge => Some(ConflictResolution::Merge),
        }
    }
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).with_context(|| format!("cannot expand path {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

fn load_config(args: &Args) -> Result<Config> {
    let path = args.config.as_deref().map(expand_path).transpose()?;
    let mut config = Config::load(path.as_deref())?;

    if let Some(level) = &args.log_level {
        if LogLevel::from_str(level).is_none() {
            bail!("invalid log level '{}'", level);
        }
        config.logging.level = level.to_lowercase();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    if let Some(queue) = &args.queue {
        config.store.queue_path = expand_path(queue)?;
    }
    Ok(config)
}

fn remote_url(config: &Config, flag: Option<String>) -> Result<String> {
    flag.or_else(|| config.remote.base_url.clone())
        .ok_or_else(|| anyhow!("no remote configured; pass --remote or set REPSYNC_REMOTE_BASE_URL"))
}

fn open_session(config: &Config, url: &str) -> Result<SyncSession> {
    let remote = HttpRemote::with_timeout(url, config.remote.request_timeout)?;
    let store = Arc::new(QueueStore::open(&config.store.queue_path));

    let session = SyncSession::new(
        store,
        Arc::new(remote),
        // No local read views to drop in a headless process
        InvalidationCoordinator::new(),
        config.flush_config(),
    )?;
    Ok(session)
}

fn enqueue(
    config: &Config,
    kind: &str,
    id: String,
    data: &str,
    base: Option<String>,
    delete: bool,
) -> Result<()> {
    let kind = EntityKind::from_str(kind).ok_or_else(|| anyhow!("unknown entity kind '{}'", kind))?;
    let data: serde_json::Value = serde_json::from_str(data).context("--data is not valid JSON")?;

    let mut intent = WriteIntent::new(EntityRef::new(kind, id), data);
    if let Some(base) = base {
        let base = base
            .parse::<DateTime<Utc>>()
            .with_context(|| format!("--base '{}' is not an RFC 3339 timestamp", base))?;
        intent = intent.based_on(base);
    }

    let item_type = if delete {
        ItemType::from(format!("{}_delete", kind))
    } else {
        ItemType::save_for(kind)
    };

    let store = QueueStore::open(&config.store.queue_path);
    let item = repsync_core::QueueItem::new(item_type, intent);
    let item_id = item.id.clone();
    store.append(item);
    // Nothing outlives this process, so an item held in memory is lost
    if store.unpersisted_len() > 0 {
        bail!("queue file {} could not be written", config.store.queue_path.display());
    }

    info!(item_id = %item_id, depth = store.len(), "queued");
    println!("{}", item_id);
    Ok(())
}

fn list(config: &Config, json: bool) -> Result<()> {
    let items = QueueStore::open(&config.store.queue_path).read()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    for item in items {
        println!(
            "{}  {:<16} {:<24} attempts={}{}",
            item.id,
            item.item_type,
            item.entity(),
            item.attempts,
            item.last_error
                .as_deref()
                .map(|e| format!("  last_error={}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let items = QueueStore::open(&config.store.queue_path).read()?;
    let retrying = items.iter().filter(|i| i.attempts > 0).count();
    let oldest = items.iter().map(|i| i.enqueued_at).min();

    let summary = serde_json::json!({
        "queuePath": config.store.queue_path,
        "pendingOperations": items.len(),
        "retrying": retrying,
        "maxAttempts": config.sync.max_attempts,
        "oldestEnqueuedAt": oldest,
        "lastError": items.iter().rev().find_map(|i| i.last_error.clone()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn flush(config: &Config, url: &str, on_conflict: OnConflict) -> Result<()> {
    let session = open_session(config, url)?;

    match session.engine.flush().await {
        FlushOutcome::Completed(report) => {
            println!(
                "delivered={} requeued={} exhausted={} conflicts={} remaining={}",
                report.delivered.len(),
                report.requeued.len(),
                report.exhausted.len(),
                report.conflicts.len(),
                session.store.len()
            );
            for exhausted in &report.exhausted {
                warn!(item_id = %exhausted.item.id, error = %exhausted.error, "item dropped after max attempts");
            }
        }
        FlushOutcome::Faulted(e) => return Err(e.into()),
        FlushOutcome::Skipped => {}
    }

    let pending = session.detector.pending();
    if pending.is_empty() {
        return Ok(());
    }

    match resolve_pending(&session, on_conflict).await? {
        Some(report) => println!(
            "conflicts resolved={} failed={}",
            report.resolved_count(),
            report.failed.len()
        ),
        None => {
            for record in &pending {
                println!("conflict {} on {} left queued", record.id, record.entity);
            }
        }
    }
    Ok(())
}

/// Apply `policy` to every pending conflict
///
/// Returns `None` when the policy keeps them queued.
async fn resolve_pending(session: &SyncSession, policy: OnConflict) -> Result<Option<ResolutionReport>> {
    let pending = session.detector.pending();
    for record in &pending {
        warn!(conflict_id = %record.id, entity = %record.entity, remote_version = %record.remote_timestamp, "conflict pending");
    }

    let Some(resolution) = policy.resolution() else {
        return Ok(None);
    };
    if pending.is_empty() {
        return Ok(None);
    }

    // Merge is only valid for some kinds; fall back to the remote copy elsewhere
    let choices: HashMap<String, ConflictResolution> = pending
        .iter()
        .filter(|record| record.allows(resolution))
        .map(|record| (record.id.clone(), resolution))
        .collect();

    let report = session.resolver.finalize(&choices).await?;
    for (id, error) in &report.failed {
        warn!(conflict_id = %id, error = %error, "conflict left pending");
    }
    Ok(Some(report))
}

async fn run(config: &Config, url: &str, on_conflict: OnConflict) -> Result<()> {
    let session = open_session(config, url)?;
    let parsed = repsync_core::remote::http::parse_base_url(url)?;
    let environment = PollingEnvironment::for_url(&parsed, config.remote.poll_interval)
        .ok_or_else(|| anyhow!("cannot derive a reachability target from {}", url))?;
    environment.probe().await;
    environment.start();

    let environment: Arc<dyn Environment> = Arc::new(environment);
    let controller = session.trigger_controller(environment);
    controller.start();

    let mut exhausted = session.engine.subscribe_exhausted();
    let mut conflicts = session.detector.subscribe();
    info!(remote = %url, on_conflict = ?on_conflict, "sync loop running, Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = exhausted.recv() => match notice {
                Ok(item) => warn!(item_id = %item.item.id, error = %item.error, "item dropped after max attempts"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "exhaustion notices lagged"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = conflicts.changed() => {
                if changed.is_err() {
                    break;
                }
                // Settling everything brings the count back to zero
                let count = *conflicts.borrow_and_update();
                if count == 0 {
                    continue;
                }
                match resolve_pending(&session, on_conflict).await {
                    Ok(Some(report)) => info!(resolved = report.resolved_count(), failed = report.failed.len(), "conflicts resolved"),
                    Ok(None) => warn!(pending = count, "conflicting entities stay blocked; rerun with --on-conflict to resolve"),
                    Err(e) => warn!(error = %e, "conflict resolution failed"),
                }
            },
        }
    }

    controller.stop().await;
    info!(pending = session.store.len(), "sync loop stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_logging_with_config(config.log_config())?;
    metrics::init_metrics();

    match args.command {
        Command::Enqueue { kind, id, data, base, delete } => {
            enqueue(&config, &kind, id, &data, base, delete)
        }
        Command::List { json } => list(&config, json),
        Command::Status => status(&config),
        Command::Flush { remote, on_conflict } => {
            let url = remote_url(&config, remote)?;
            flush(&config, &url, on_conflict).await
        }
        Command::Run { remote, on_conflict } => {
            let url = remote_url(&config, remote)?;
            run(&config, &url, on_conflict).await
        }
    }
}
