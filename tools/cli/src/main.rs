//! wcpos-sync - keep a local replica of a store's REST collections.
//!
//! Replicas are kept as JSON snapshots in the data directory, so an offline
//! point of sale can start from the last synced state.

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wcpos_common::{CollectionName, ReplicationIdentifier};
use wcpos_remote::{RemoteResourceClient, RestClient};
use wcpos_replication::{
    ConnectivitySignal, IdAuditReplicator, ReachabilityProbe, ReplicationCheckpoint,
    ReplicationSupervisor, Replicator, RunOutcome, SyncReplicator,
};
use wcpos_store::{LocalCollection, MemoryCollection};

use crate::config::{snapshot_path, CliConfig};

#[derive(Parser)]
#[command(name = "wcpos-sync")]
#[command(about = "WCPOS replication - local replicas of store collections")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file.
    #[arg(short, long, global = true, default_value = "wcpos-sync.json")]
    config: PathBuf,

    /// Snapshot directory (overrides the config file).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate continuously until interrupted.
    Sync {
        /// Collections to replicate (default: all configured).
        #[arg(short = 'C', long = "collection")]
        collections: Vec<String>,
    },

    /// Run one audit, pull until nothing is outstanding, then exit.
    Audit {
        /// Collections to replicate (default: all configured).
        #[arg(short = 'C', long = "collection")]
        collections: Vec<String>,
    },

    /// Show replica counts and task checkpoints.
    Status {
        /// Collections to show (default: all configured).
        #[arg(short = 'C', long = "collection")]
        collections: Vec<String>,
    },

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder().with_target(false).compact();
    match EnvFilter::try_from_default_env() {
        Ok(filter) if !cli.verbose => {
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?
        }
        _ => tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?,
    }

    match cli.command {
        Commands::Sync { collections } => {
            let config = CliConfig::load(&cli.config)?;
            cmd_sync(&config, &collections, cli.data_dir.as_deref()).await
        }

        Commands::Audit { collections } => {
            let config = CliConfig::load(&cli.config)?;
            cmd_audit(&config, &collections, cli.data_dir.as_deref()).await
        }

        Commands::Status { collections } => {
            let config = CliConfig::load(&cli.config)?;
            cmd_status(&config, &collections, cli.data_dir.as_deref()).await
        }

        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "wcpos-sync",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

/// A collection replica and the file it is persisted to.
struct Replica {
    collection: Arc<MemoryCollection>,
    path: PathBuf,
}

impl Replica {
    fn name(&self) -> &CollectionName {
        self.collection.name()
    }

    async fn save(&self) -> Result<()> {
        self.collection
            .save_to(&self.path)
            .await
            .with_context(|| format!("Failed to save {}", self.path.display()))
    }
}

/// Open the replicas of the selected collections from their snapshots.
async fn open_replicas(
    config: &CliConfig,
    only: &[String],
    data_dir: Option<&Path>,
) -> Result<Vec<Replica>> {
    let data_dir = config.data_dir(data_dir)?;
    let mut replicas = Vec::new();

    for name in config.collections(only)? {
        let path = snapshot_path(&data_dir, &name);
        let collection = MemoryCollection::new(name);
        let found = collection
            .load_from(&path)
            .await
            .with_context(|| format!("Failed to load snapshot {}", path.display()))?;
        if found {
            debug!("Loaded {} from {}", collection.name(), path.display());
        }
        replicas.push(Replica {
            collection: Arc::new(collection),
            path,
        });
    }

    Ok(replicas)
}

async fn save_all(replicas: &[Replica]) {
    for replica in replicas {
        if let Err(e) = replica.save().await {
            warn!("{:#}", e);
        }
    }
}

fn open_remote(config: &CliConfig) -> Result<Arc<dyn RemoteResourceClient>> {
    let client = RestClient::new(config.store.clone()).context("Failed to create REST client")?;
    Ok(Arc::new(client))
}

/// Replicate until Ctrl-C.
async fn cmd_sync(config: &CliConfig, only: &[String], data_dir: Option<&Path>) -> Result<()> {
    let replicas = open_replicas(config, only, data_dir).await?;
    let remote = open_remote(config)?;
    let supervisor = Arc::new(ReplicationSupervisor::new(
        remote.clone(),
        config.replication(),
    ));

    let signal = ConnectivitySignal::new(true);
    let cancel = CancellationToken::new();
    let probe = ReachabilityProbe::new(
        remote.clone(),
        signal.clone(),
        Duration::from_secs(config.probe_interval_secs.max(1)),
    )
    .spawn(cancel.clone());
    let watcher = supervisor.clone().watch_connectivity(signal.gate());

    info!(
        "Replicating {} collections from {}",
        replicas.len(),
        config.store.base_url
    );
    ensure_all(&supervisor, &replicas).await;

    let mut gate = signal.gate();
    let mut save_tick =
        tokio::time::interval(Duration::from_secs(config.save_interval_secs.max(1)));
    save_tick.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                break;
            }
            _ = save_tick.tick() => {
                save_all(&replicas).await;
                // Resume anything a connectivity drop cancelled.
                if gate.is_connected() {
                    ensure_all(&supervisor, &replicas).await;
                }
            }
            change = gate.changed() => match change {
                Some(true) => ensure_all(&supervisor, &replicas).await,
                Some(false) => {}
                None => break,
            },
        }
    }

    cancel.cancel();
    supervisor.shutdown().await;
    if let Err(e) = probe.await {
        warn!("Reachability probe panicked: {}", e);
    }
    if let Err(e) = watcher.await {
        warn!("Connectivity watcher panicked: {}", e);
    }

    save_all(&replicas).await;
    print_summary(&replicas).await;
    Ok(())
}

async fn ensure_all(supervisor: &ReplicationSupervisor, replicas: &[Replica]) {
    for replica in replicas {
        supervisor.ensure(replica.collection.clone()).await;
    }
}

/// Run a replicator once and record it in its checkpoint.
async fn run_recorded(replicator: &dyn Replicator, cancel: &CancellationToken) -> Result<RunOutcome> {
    let collection = replicator.collection();
    let identifier = replicator.identifier();
    let mut checkpoint = ReplicationCheckpoint::load(&**collection, identifier).await?;

    checkpoint.mark_started();
    let result = replicator.run_once(cancel).await;
    match &result {
        Ok(outcome) => checkpoint.mark_succeeded(outcome.clone()),
        Err(e) => checkpoint.mark_failed(e.to_string()),
    }
    checkpoint.store(&**collection, identifier).await?;

    result.with_context(|| format!("{} failed", identifier))
}

/// One audit and as many pulls as it takes, per collection.
async fn cmd_audit(config: &CliConfig, only: &[String], data_dir: Option<&Path>) -> Result<()> {
    let replicas = open_replicas(config, only, data_dir).await?;
    let remote = open_remote(config)?;
    let replication = config.replication();
    let cancel = CancellationToken::new();

    for replica in &replicas {
        let collection: Arc<dyn LocalCollection> = replica.collection.clone();
        let audit = IdAuditReplicator::new(collection.clone(), remote.clone(), &replication);
        let sync = SyncReplicator::new(collection, remote.clone(), &replication);

        let audited = run_recorded(&audit, &cancel).await?;
        info!("{}: {:?}", replica.name(), audited);

        loop {
            match run_recorded(&sync, &cancel).await? {
                RunOutcome::Pulled { persisted, .. } if persisted > 0 => {
                    debug!("{}: pulled {} documents", replica.name(), persisted);
                }
                outcome => {
                    debug!("{}: stopping after {:?}", replica.name(), outcome);
                    break;
                }
            }
        }

        replica.save().await?;
    }

    print_summary(&replicas).await;
    Ok(())
}

async fn print_summary(replicas: &[Replica]) {
    for replica in replicas {
        let stats = replica.collection.stats().await;
        println!(
            "{}: {} synced, {} outstanding",
            replica.name(),
            stats.synced,
            stats.unsynced
        );
    }
}

/// Print counts and checkpoints from the snapshots.
async fn cmd_status(config: &CliConfig, only: &[String], data_dir: Option<&Path>) -> Result<()> {
    let replicas = open_replicas(config, only, data_dir).await?;

    for replica in &replicas {
        let stats = replica.collection.stats().await;
        println!("{}:", replica.name());
        println!("  Snapshot: {}", replica.path.display());
        println!("  Synced: {}", stats.synced);
        println!("  Outstanding: {}", stats.unsynced);

        for identifier in [
            ReplicationIdentifier::audit(replica.name()),
            ReplicationIdentifier::sync(replica.name()),
        ] {
            let checkpoint =
                ReplicationCheckpoint::load(&*replica.collection, &identifier).await?;
            print_checkpoint(&identifier, &checkpoint);
        }
    }

    Ok(())
}

fn print_checkpoint(identifier: &ReplicationIdentifier, checkpoint: &ReplicationCheckpoint) {
    println!("  {}:", identifier);
    match checkpoint.last_finished {
        None => {
            println!("    Never run");
            return;
        }
        Some(finished) => println!("    Last run: {}", finished.format("%Y-%m-%d %H:%M:%S UTC")),
    }
    if let Some(success) = checkpoint.last_success {
        println!("    Last success: {}", success.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("    Runs: {}", checkpoint.runs);
    if checkpoint.consecutive_failures > 0 {
        println!("    Failing: {} in a row", checkpoint.consecutive_failures);
    }
    if let Some(error) = &checkpoint.last_error {
        println!("    Last error: {}", error);
    }
    if let Some(outcome) = &checkpoint.last_outcome {
        println!("    Last outcome: {:?}", outcome);
    }
}
