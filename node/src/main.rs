// Copyright (c) 2026 Hover Maintainers. MIT License.
// See LICENSE for details.

//! # hover
//!
//! Entry point for the `hover` binary. `hover run` starts the daemon; the
//! remaining subcommands (`add-address`, `up`, `down`, `status`, `info`)
//! administer a running daemon over its HTTP surface.
//!
//! The daemon runs everything on a single-threaded runtime on purpose: the
//! protocol's correctness argument leans on key-change handlers never
//! overlapping, so the whole coordination plane is one cooperative task
//! loop and only subprocesses, pings, and disk writes leave it.

mod api;
mod cli;
mod client;
mod logging;
mod metrics;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::lookup_host;
use tokio::signal;

use hover_protocol::controller::{Controller, ControllerConfig, ControllerHandle};
use hover_protocol::gossip::{GossipConfig, Gossiper};
use hover_protocol::platform::{LinuxAddressOps, Platform};
use hover_protocol::probe::Pinger;
use hover_protocol::store::KeyStore;

use cli::{Commands, HoverCli, RunArgs};
use client::AdminClient;
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = HoverCli::parse();
    match cli.command {
        Commands::Run(args) => run_node(args, cli.port).await,
        Commands::AddAddress { resource } => {
            cli::validate_resource(&resource).map_err(|e| anyhow::anyhow!(e))?;
            let client = AdminClient::new(cli.host, cli.port, cli.dump);
            let resource_id = client.add_address(&resource).await?;
            println!("{}", resource_id);
            Ok(())
        }
        Commands::Up => {
            AdminClient::new(cli.host, cli.port, cli.dump)
                .set_status("up")
                .await
        }
        Commands::Down => {
            AdminClient::new(cli.host, cli.port, cli.dump)
                .set_status("down")
                .await
        }
        Commands::Status { no_resolve } => {
            print_status(AdminClient::new(cli.host, cli.port, cli.dump), no_resolve).await
        }
        Commands::Info { no_resolve } => {
            print_info(AdminClient::new(cli.host, cli.port, cli.dump), no_resolve).await
        }
        Commands::Version => {
            println!("hover {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — daemon startup
// ---------------------------------------------------------------------------

/// Starts the daemon.
///
/// Startup sequence:
/// 1. Initialize logging
/// 2. Resolve the listen address and gateway
/// 3. Open the ICMP socket (fatal without CAP_NET_RAW)
/// 4. Open the persistent store
/// 5. Wire gossiper → keystore → platform → controller
/// 6. Bind the gossip UDP socket and start the substrate
/// 7. Load persisted state (re-announcing it to the cluster)
/// 8. Start the controller, event pump, and connectivity loop
/// 9. Serve the admin HTTP surface until shutdown
async fn run_node(args: RunArgs, port: u16) -> Result<()> {
    logging::init_logging(
        &format!("hover={level},hover_protocol={level}", level = args.log_level),
        LogFormat::from_str_lossy(&args.log_format),
    );

    let listen_addr = resolve_host_port(&args.listen_address, port)
        .await
        .with_context(|| format!("cannot resolve listen address {}", args.listen_address))?;
    let gateway = resolve_ipv4(&args.gateway)
        .await
        .with_context(|| format!("cannot resolve gateway {}", args.gateway))?;
    let name = listen_addr.to_string();

    tracing::info!(
        name = %name,
        gateway = %gateway,
        data_file = %args.data_file.display(),
        dead_at = args.dead_at,
        "starting hover"
    );

    // Fail before touching anything else if we cannot probe: a peer that
    // cannot see its gateway must never advertise itself as up.
    let pinger = Pinger::new(gateway).context("ICMP probe setup failed")?;

    let db = sled::open(&args.data_file)
        .with_context(|| format!("cannot open data file {}", args.data_file.display()))?;

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut gossip_config = GossipConfig::new(name.clone());
    gossip_config.phi_threshold = args.dead_at;
    if let Some(attach) = &args.attach {
        let seed = if attach.contains(':') {
            attach.clone()
        } else {
            format!("{}:{}", attach, port)
        };
        tracing::info!(seed = %seed, "attaching to existing cluster");
        gossip_config.seeds.push(seed);
    }
    let gossiper = Gossiper::new(gossip_config, events_tx);
    let store = KeyStore::new(gossiper.clone(), Some(db));
    let platform = Platform::new(Arc::new(LinuxAddressOps::new()));
    let controller = ControllerHandle::new(Controller::new(
        gossiper.clone(),
        store.clone(),
        platform.clone(),
        ControllerConfig {
            priority: args.priority,
            ..ControllerConfig::default()
        },
    ));

    // Gossip substrate on UDP.
    let udp = tokio::net::UdpSocket::bind(listen_addr)
        .await
        .with_context(|| format!("cannot bind gossip socket on {}", listen_addr))?;
    tokio::spawn(gossiper.clone().run(udp));

    // Replayed state replicates exactly like fresh writes would.
    let loaded = store.load().context("cannot load persisted keystore")?;
    tracing::info!(entries = loaded, "persistent state loaded");

    controller.start();
    tokio::spawn(controller.clone().run(events_rx));
    controller.spawn_connectivity_loop(pinger);

    // Admin HTTP surface on the same address, TCP side.
    let state = api::AppState {
        controller,
        gossiper,
        store,
        platform,
        metrics: Arc::new(NodeMetrics::new()),
    };
    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("cannot bind admin listener on {}", listen_addr))?;
    tracing::info!(addr = %listen_addr, "admin surface listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    tracing::info!("hover stopped");
    Ok(())
}

/// Resolves `host` plus an explicit port to a socket address.
async fn resolve_host_port(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .context("no addresses resolved")
}

/// Resolves a hostname to its first IPv4 address.
async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    let addrs = lookup_host((host, 0)).await?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    anyhow::bail!("no IPv4 address resolved")
}

/// Waits for SIGINT or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// status / info — client-side rendering
// ---------------------------------------------------------------------------

/// `hover status`: one line per resource.
async fn print_status(client: AdminClient, no_resolve: bool) -> Result<()> {
    let resources = client.resources().await?;
    let Some(entries) = resources.as_object() else {
        anyhow::bail!("unexpected resource listing: {}", resources);
    };
    for info in entries.values() {
        let address = info["resource"].as_str().unwrap_or("<unknown>");
        match info.get("assigned_to").and_then(|v| v.as_str()) {
            Some(peer) => {
                println!("{} assigned to {}", address, display_peer(peer, no_resolve))
            }
            None => println!("{} is not assigned", address),
        }
    }
    Ok(())
}

/// `hover info`: one line per peer.
async fn print_info(client: AdminClient, no_resolve: bool) -> Result<()> {
    let info = client.info().await?;
    let Some(neighborhood) = info["neighborhood"].as_object() else {
        anyhow::bail!("unexpected info response: {}", info);
    };
    for (peer, data) in neighborhood {
        let liveness = if data["alive"].as_bool().unwrap_or(false) {
            "alive"
        } else {
            "dead"
        };
        println!("{} is {}", display_peer(peer, no_resolve), liveness);
    }
    Ok(())
}

/// Peer names are `host:port`; the resolved form shows just the host.
fn display_peer(name: &str, no_resolve: bool) -> String {
    if no_resolve {
        return name.to_string();
    }
    name.split(':').next().unwrap_or(name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_peer_strips_the_port_unless_told_not_to() {
        assert_eq!(display_peer("10.0.0.1:4573", false), "10.0.0.1");
        assert_eq!(display_peer("10.0.0.1:4573", true), "10.0.0.1:4573");
        assert_eq!(display_peer("bare-name", false), "bare-name");
    }

    #[tokio::test]
    async fn resolves_numeric_hosts() {
        let addr = resolve_host_port("127.0.0.1", 4573).await.expect("resolves");
        assert_eq!(addr.to_string(), "127.0.0.1:4573");

        let gateway = resolve_ipv4("127.0.0.1").await.expect("resolves");
        assert_eq!(gateway, Ipv4Addr::LOCALHOST);
    }
}
