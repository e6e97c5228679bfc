//! parcel - command line client for the parcel tracking store.
//!
//! # Usage
//!
//! ```bash
//! # Look up a package by tracking number
//! parcel track PKG-1A2B3C4D5E6F
//!
//! # List packages, optionally for one user
//! parcel list --user u-42
//!
//! # Move a package along its lifecycle
//! parcel advance <id> in_transit
//! parcel deliver <id>
//!
//! # Push locally pending writes, once or until Ctrl-C
//! parcel sync
//! parcel sync --watch
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parcel_core::{
    ClientConfig, HttpRemoteStore, LocalCache, Package, PackageRepository, PackageStatus, Reconciler,
    RemoteStore, TcpProbe,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "parcel")]
#[command(author = "Parcel Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Parcel tracking client", long_about = None)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true, default_value = "parcel.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show a package by tracking number
    Track {
        tracking_number: String,
    },

    /// List packages, newest first
    List {
        /// Only packages owned by this user id
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Change the status of a package
    Advance {
        /// Package id
        id: String,
        /// New status (pending, in_transit, delivered, cancelled)
        status: PackageStatus,
    },

    /// Mark a package delivered
    Deliver {
        /// Package id
        id: String,
    },

    /// Delete a package
    Delete {
        /// Package id
        id: String,
    },

    /// Push locally pending writes to the remote store
    Sync {
        /// Keep reconciling on the configured interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },

    /// Show local cache counts
    Cache {
        /// Also list every cached package
        #[arg(long)]
        list: bool,
    },

    /// Print the effective configuration
    Config,
}

struct Client {
    packages: PackageRepository,
    reconciler: Reconciler,
    cache: Arc<LocalCache>,
    probe: Arc<TcpProbe>,
}

impl Client {
    async fn connect(config: &ClientConfig) -> Result<Self> {
        let remote: Arc<dyn RemoteStore> = Arc::new(
            HttpRemoteStore::new(&config.remote_base_url, config.request_timeout())
                .context("Failed to create remote store client")?,
        );
        let cache = Arc::new(
            LocalCache::open(&config.cache_path)
                .with_context(|| format!("Failed to open cache at {:?}", config.cache_path))?,
        );
        let probe = Arc::new(TcpProbe::new(config.probe_addr.clone(), config.probe_timeout()));
        probe.refresh().await;

        Ok(Self {
            packages: PackageRepository::new(remote.clone(), cache.clone(), probe.clone(), config),
            reconciler: Reconciler::new(remote, cache.clone(), probe.clone(), config),
            cache,
            probe,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = ClientConfig::load(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let client = Client::connect(&config).await?;

    match cli.command {
        Commands::Track { tracking_number } => {
            let package = client.packages.get_by_tracking_number(&tracking_number).await?;
            print_package(&package);
        }

        Commands::List { user } => {
            let packages = match user {
                Some(user_id) => client.packages.get_by_user(&user_id).await?,
                None => client.packages.get_all().await?,
            };
            if packages.is_empty() {
                println!("No packages");
            }
            for package in &packages {
                println!(
                    "{:<22} {:<16} {:<11} {}",
                    package.id, package.tracking_number, package.status, package.recipient_name
                );
            }
        }

        Commands::Advance { id, status } => {
            let package = client.packages.update_status(&id, status).await?;
            print_package(&package);
        }

        Commands::Deliver { id } => {
            let package = client.packages.mark_delivered(&id).await?;
            print_package(&package);
        }

        Commands::Delete { id } => {
            client.packages.delete(&id).await?;
            println!("Deleted {}", id);
        }

        Commands::Sync { watch } => {
            if watch {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Shutdown requested");
                        let _ = tx.send(true);
                    }
                });
                let refresher = client.probe.spawn_refresh(config.probe_interval(), rx.clone());
                client.reconciler.run(config.reconcile_interval(), rx).await;
                refresher.abort();
            } else {
                let report = client.reconciler.reconcile_once().await?;
                if report.skipped_offline {
                    println!("Offline, nothing pushed");
                } else {
                    println!(
                        "Pushed {}, purged {}, discarded {}, failed {}",
                        report.pushed, report.purged, report.discarded, report.failed
                    );
                }
                if !report.is_clean() {
                    anyhow::bail!("{} record(s) could not be pushed", report.failed);
                }
            }
        }

        Commands::Cache { list } => {
            let stats = client.cache.stats()?;
            println!("Cache: {:?}", config.cache_path);
            println!("  packages: {} ({} pending)", stats.packages, stats.dirty_packages);
            println!("  users:    {} ({} pending)", stats.users, stats.dirty_users);
            if list {
                for entry in client.cache.all::<Package>()? {
                    println!(
                        "  {:<22} {:<16} {:<11}{}",
                        entry.record.id,
                        entry.record.tracking_number,
                        entry.record.status,
                        if entry.dirty { " (pending)" } else { "" }
                    );
                }
            }
        }

        Commands::Config => {}
    }

    Ok(())
}

fn print_package(package: &Package) {
    println!("Package {}", package.id);
    println!("  Tracking:   {}", package.tracking_number);
    println!("  Status:     {}", package.status);
    println!("  Priority:   {}", package.priority);
    println!("  From:       {}", package.sender_name);
    println!("  To:         {} ({})", package.recipient_name, package.recipient_phone);
    println!("  Address:    {}", package.recipient_address);
    println!("  Weight:     {} kg", package.weight);
    println!("  ETA:        {}", package.estimated_delivery_at.format("%Y-%m-%d %H:%M UTC"));
    if let Some(delivered_at) = package.delivered_at {
        println!("  Delivered:  {}", delivered_at.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(notes) = &package.notes {
        println!("  Notes:      {}", notes);
    }
}
