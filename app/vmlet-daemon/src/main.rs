use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmlet_api::Machine;
use vmlet_events::EventRing;
use vmlet_host::SysProbe;
use vmlet_resources::{build_source, validate_config, ResourceManager, SourceConfig};
use vmlet_store::{Store, StoreOptions};

#[derive(Debug, Parser)]
#[command(name = "vmlet-daemon")]
#[command(author, version, about, long_about = None)]
pub struct DaemonArgs {
    /// Data directory (machine records live under <data-dir>/machines).
    #[arg(long, default_value = "/var/lib/vmlet")]
    pub data_dir: PathBuf,

    /// Machine class catalog, JSON or YAML.
    #[arg(long)]
    pub machine_classes: PathBuf,

    /// Resource sources to enable.
    #[arg(long = "source", value_name = "NAME")]
    pub sources: Vec<String>,

    /// CPU over-commit factor.
    #[arg(long, default_value_t = 1.0)]
    pub overcommit_vcpu: f64,

    /// Memory withheld from guests, in bytes.
    #[arg(long, default_value_t = 0)]
    pub reserved_memory: u64,

    /// Hugepages withheld from guests.
    #[arg(long, default_value_t = 0)]
    pub blocked_hugepages: u64,

    /// Total NIC budget (required with the nic source).
    #[arg(long, default_value_t = 0)]
    pub nic_limit: u64,

    /// NICs withheld from guests.
    #[arg(long, default_value_t = 0)]
    pub reserved_nics: u64,

    /// PCI passthrough catalog (required with the pci source).
    #[arg(long)]
    pub pci_catalog: Option<PathBuf>,

    /// Maximum number of live machines; 0 disables the limit.
    #[arg(long, default_value_t = 0)]
    pub vm_limit: u64,

    /// Event ring capacity.
    #[arg(long, default_value_t = 100)]
    pub event_capacity: usize,

    /// Event time-to-live in seconds.
    #[arg(long, default_value_t = 3600)]
    pub event_ttl_secs: u64,

    /// Interval between event expiry sweeps, in seconds.
    #[arg(long, default_value_t = 60)]
    pub event_resync_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vmlet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(DaemonArgs::parse()).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    info!("starting vmlet daemon");

    let enabled = if args.sources.is_empty() {
        vmlet_resources::config::default_source_names()
    } else {
        args.sources.clone()
    };
    let source_config = SourceConfig {
        overcommit_vcpu: args.overcommit_vcpu,
        reserved_memory: args.reserved_memory,
        blocked_hugepages: args.blocked_hugepages,
        nic_limit: args.nic_limit,
        reserved_nics: args.reserved_nics,
        pci_catalog: args.pci_catalog.clone(),
    };
    validate_config(&enabled, &source_config).context("invalid source configuration")?;

    let store: Arc<Store<Machine>> = Arc::new(
        Store::new(StoreOptions::new(args.data_dir.join("machines")))
            .context("opening machine store")?,
    );
    let swept = store.sweep_swap_files().context("sweeping swap files")?;
    if swept > 0 {
        info!(swept, "removed stale swap files from interrupted writes");
    }

    let probe = Arc::new(SysProbe::default());
    let manager = Arc::new(ResourceManager::new());
    for name in &enabled {
        let source = build_source(name, &source_config, probe.clone())
            .with_context(|| format!("building source {name}"))?;
        manager.add_source(source)?;
        info!(source = %name, "source registered");
    }
    manager.set_vm_limit(args.vm_limit)?;
    manager.set_machine_classes_file(&args.machine_classes)?;

    let shutdown = CancellationToken::new();

    {
        let store = store.clone();
        manager
            .initialize(
                shutdown.clone(),
                Some(Box::new(move || {
                    store.list().map_err(|e| e.into())
                })),
            )
            .context("initializing resource manager")?;
    }

    for status in manager.machine_class_status()? {
        info!(class = %status.class.name, available = status.available, "machine class ready");
    }

    let events = Arc::new(EventRing::new(
        args.event_capacity,
        Duration::from_secs(args.event_ttl_secs),
    ));
    let expirer = {
        let events = events.clone();
        let cancel = shutdown.clone();
        let resync = Duration::from_secs(args.event_resync_secs);
        tokio::spawn(async move {
            events.start(cancel, resync).await;
        })
    };

    info!("vmlet daemon ready");
    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    shutdown.cancel();
    expirer.await.ok();
    Ok(())
}
