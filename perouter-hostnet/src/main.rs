//! perouter-hostnet: converges the host dataplane of a provider edge router.

use anyhow::{Context, bail};
use clap::Parser;
use perouter_hostnet::bpf::DEFAULT_NIC_INGRESS_OBJECT;
use perouter_hostnet::{
    BpfSteeringLoader, DesiredState, HostDataplane, NicMode, StartOptions, SteeringObjects,
    SystemKernel, sysctl,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Desired state JSON
    #[arg(short, long, default_value = "/etc/perouter/hostnet.json")]
    config: PathBuf,

    /// Seconds between neighbour refreshes on L2 VNI bridges
    #[arg(long, default_value_t = 60)]
    refresh_period: u64,

    /// Directory holding the nic-ingress and ul-host-ingress objects
    #[arg(long)]
    ebpf_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Reconcile once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level))
        .add_directive("netlink_proto=warn".parse().expect("static directive"))
        .add_directive("rtnetlink=warn".parse().expect("static directive"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let state = DesiredState::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let objects = match &args.ebpf_dir {
        Some(dir) => SteeringObjects::in_dir(dir),
        None => SteeringObjects::default(),
    };
    info!(
        ebpf_dir = %args.ebpf_dir.as_deref().unwrap_or(default_ebpf_dir()).display(),
        "perouter-hostnet starting"
    );

    let dataplane = HostDataplane::new(
        Arc::new(SystemKernel),
        Box::new(BpfSteeringLoader::new(objects)),
    );
    let options = StartOptions {
        refresh_period: Some(Duration::from_secs(args.refresh_period)),
    };

    let result = reconcile(&dataplane, &state, options).await;
    if args.once || result.is_err() {
        dataplane.shutdown().await;
        return result;
    }

    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    info!(
        refreshers = dataplane.refreshers().active_count().await,
        "reconciled, waiting for signal"
    );
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    info!("Shutting down...");
    dataplane.shutdown().await;
    Ok(())
}

async fn reconcile(
    dataplane: &HostDataplane,
    state: &DesiredState,
    options: StartOptions,
) -> anyhow::Result<()> {
    let Some(target_ns) = state.target_ns().cloned() else {
        bail!("desired state names no router namespace");
    };

    sysctl::ensure_router_sysctls(&target_ns).context("failed to converge sysctls")?;

    let shared = state
        .underlay
        .as_ref()
        .is_some_and(|u| u.nic_mode == NicMode::Shared);
    if let Some(underlay) = &state.underlay {
        if shared {
            dataplane
                .setup_shared_underlay(underlay)
                .await
                .context("failed to set up shared underlay")?;
        } else {
            dataplane
                .setup_underlay(underlay)
                .await
                .context("failed to set up underlay")?;
        }
    }

    for params in &state.l3vnis {
        dataplane
            .setup_l3_vni(params)
            .await
            .with_context(|| format!("failed to set up L3 VNI {}", params.base.vni))?;
    }
    for params in &state.l2vnis {
        dataplane
            .setup_l2_vni(params)
            .await
            .with_context(|| format!("failed to set up L2 VNI {}", params.base.vni))?;
        dataplane.refreshers().start_for_vni(params, options).await;
    }

    dataplane
        .remove_non_configured_vnis(&target_ns, &state.vni_params())
        .await
        .context("failed to remove stale VNIs")?;
    dataplane
        .refreshers()
        .stop_for_removed_vnis(&state.l2vnis)
        .await;

    if shared {
        dataplane
            .update_shared_underlay_vnis(&state.vnis())
            .await
            .context("failed to update steered VNIs")?;
    }

    info!(
        l3vnis = state.l3vnis.len(),
        l2vnis = state.l2vnis.len(),
        "dataplane reconciled"
    );
    Ok(())
}

fn default_ebpf_dir() -> &'static Path {
    Path::new(DEFAULT_NIC_INGRESS_OBJECT)
        .parent()
        .unwrap_or(Path::new("/"))
}
