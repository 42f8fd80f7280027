use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lagmon::cli::Args;
use lagmon::config::Config;
use lagmon::discovery::{self, Discovery, MdnsSocket};
use lagmon::probe::{IcmpProber, ProbeEngine, TcpProber, UdpProber};
use lagmon::store::LatencyStore;
use lagmon::terminal::DashboardServer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from(&args);
    info!(
        udp_port = config.udp_port,
        dashboard_port = config.dashboard_port,
        probe_interval = ?config.probe_interval,
        lookup_interval = ?config.lookup_interval,
        refresh_interval = ?config.refresh_interval,
        advertise_tcp = config.advertise_tcp,
        "starting"
    );

    let store = Arc::new(LatencyStore::new());
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl_c_cancel.cancel();
    });

    // terminal dashboard
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.dashboard_port))
        .await
        .with_context(|| format!("failed to bind dashboard port {}", config.dashboard_port))?;
    let dashboard = Arc::new(DashboardServer::new(store.clone()));
    dashboard.spawn(listener, config.refresh_interval, cancel.clone());

    // service discovery
    let base_hostname = match config.hostname_override.clone() {
        Some(hostname) => hostname,
        None => hostname::get()
            .context("failed to read the OS hostname")?
            .to_string_lossy()
            .into_owned(),
    };
    let mdns = Arc::new(MdnsSocket::open()?);
    let discovery = Arc::new(Discovery::new(
        store.clone(),
        config.advertise_tcp,
        base_hostname,
        StdRng::from_entropy(),
    ));
    let mdns_receiver = discovery::spawn(discovery, mdns, cancel.clone(), config.lookup_interval);

    // latency probes
    let udp = Arc::new(UdpProber::bind(config.udp_port, store.clone()).await?);
    udp.spawn(cancel.clone());
    let icmp = Arc::new(IcmpProber::open(store.clone(), StdRng::from_entropy())?);
    let icmp_receiver = icmp.spawn_receiver(cancel.clone());
    let tcp = Arc::new(TcpProber::new(store.clone(), cancel.clone()));

    let engine = ProbeEngine::new(
        store,
        udp,
        icmp,
        tcp,
        config.probe_interval,
        cancel.clone(),
    );
    tokio::spawn(engine.run());

    cancel.cancelled().await;
    info!("shutting down");

    // the blocking receivers poll their read timeouts and notice the token
    let _ = tokio::task::spawn_blocking(move || {
        let _ = mdns_receiver.join();
        let _ = icmp_receiver.join();
    })
    .await;

    Ok(())
}
