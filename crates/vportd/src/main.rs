//! Virtual Port Registry Daemon
//!
//! Main entry point for vportd. Bootstraps the registry from a host
//! enumeration, activates the switch, replays fabric notifications and
//! answers port queries.

use anyhow::{Context, Result};
use clap::Parser;
use ovs_vportd::{
    ChannelNotifier, FabricEvent, HostEnumeration, HvIdentity, QueryKey, RegistryConfig,
    TunnelRequest, VportEvent, VportRegistry, DEFAULT_CONFIG_PATH,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Virtual port registry for a software switch datapath
#[derive(Parser, Debug)]
#[command(name = "vportd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Host enumeration (JSON) used to bootstrap the registry
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Fabric notifications (JSON array) to replay after activation
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Port number or name to describe (repeatable)
    #[arg(short, long)]
    query: Vec<String>,

    /// Log filter, overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,
}

/// Datapath port assignment for a fabric vport.
#[derive(Debug, Deserialize)]
struct Binding {
    port_id: u32,
    #[serde(default)]
    nic_index: u32,
    port_no: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    upcall_pid: u32,
}

/// Bootstrap file: host enumeration plus datapath state.
#[derive(Debug, Default, Deserialize)]
struct Snapshot {
    #[serde(flatten)]
    host: HostEnumeration,
    #[serde(default)]
    bindings: Vec<Binding>,
    #[serde(default)]
    tunnels: Vec<TunnelRequest>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = RegistryConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let filter = args.log_level.as_deref().unwrap_or(&config.log_filter);
    init_logging(filter)?;

    info!(config = %args.config.display(), "vportd: Starting");

    let (notifier, rx) = ChannelNotifier::new();
    let registry = Arc::new(VportRegistry::with_notifier(config, Arc::new(notifier))?);
    let drain = tokio::spawn(drain_events(rx));

    let outcome = run(&args, &registry).await;

    // Dropping the last registry handle closes the event channel
    drop(registry);
    if let Err(e) = drain.await {
        warn!(error = %e, "vportd: Event drain task failed");
    }

    match outcome {
        Ok(()) => {
            info!("vportd: Exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "vportd: Exiting with error");
            Err(e)
        }
    }
}

/// Initialize structured logging
fn init_logging(filter: &str) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(filter).context("invalid log filter")?)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

async fn run(args: &Args, registry: &Arc<VportRegistry>) -> Result<()> {
    let snapshot = match &args.snapshot {
        Some(path) => read_json::<Snapshot>(path)?,
        None => Snapshot::default(),
    };

    if let Err(e) = bootstrap(registry, &snapshot) {
        registry.fail_activation();
        return Err(e);
    }
    registry.activate();

    if let Some(path) = &args.events {
        let events: Vec<FabricEvent> = read_json(path)?;
        replay(registry, events).await?;
    }

    for key in &args.query {
        let key: QueryKey = key.parse()?;
        match registry.describe(&key) {
            Ok(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            Err(e) => warn!(%key, error = %e, "vportd: Query failed"),
        }
    }
    Ok(())
}

fn bootstrap(registry: &VportRegistry, snapshot: &Snapshot) -> Result<()> {
    let ports = registry
        .add_configured_ports(&snapshot.host.ports)
        .context("adding configured ports")?;
    let nics = registry.init_configured_nics(&snapshot.host.nics);

    for b in &snapshot.bindings {
        registry
            .bind_port(
                HvIdentity::new(b.port_id, b.nic_index),
                b.port_no,
                b.name.as_deref(),
                b.upcall_pid,
            )
            .with_context(|| format!("binding port {}", b.port_no))?;
    }
    for tunnel in &snapshot.tunnels {
        registry
            .add_tunnel_vport(tunnel)
            .with_context(|| format!("adding tunnel {}", tunnel.name))?;
    }

    info!(
        ports,
        nics,
        bindings = snapshot.bindings.len(),
        tunnels = snapshot.tunnels.len(),
        "vportd: Registry bootstrapped"
    );
    Ok(())
}

/// Apply fabric notifications in order. Handlers may block on activation, so
/// they run off the async workers.
async fn replay(registry: &Arc<VportRegistry>, events: Vec<FabricEvent>) -> Result<()> {
    let registry = Arc::clone(registry);
    let (applied, rejected) = tokio::task::spawn_blocking(move || {
        let mut applied = 0usize;
        let mut rejected = 0usize;
        for event in &events {
            match registry.dispatch(event) {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(%event, error = %e, "vportd: Notification rejected");
                    rejected += 1;
                }
            }
        }
        (applied, rejected)
    })
    .await
    .context("replay task panicked")?;

    info!(applied, rejected, "vportd: Fabric notifications replayed");
    Ok(())
}

async fn drain_events(mut rx: mpsc::UnboundedReceiver<VportEvent>) {
    while let Some(event) = rx.recv().await {
        info!(port_no = event.port_no, events = ?event.events, "vportd: Vport event");
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}
