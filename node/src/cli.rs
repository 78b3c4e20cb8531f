//! # CLI Interface
//!
//! One binary, two personalities: `hover run` starts the daemon, everything
//! else is an admin client talking to a running daemon over HTTP. The
//! client flags (`--host`, `--port`, `--dump`) are global so they sit in
//! front of any subcommand.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use hover_protocol::config::DEFAULT_PORT;

/// High-availability manager for floating service addresses.
///
/// Distributes virtual IPv4 addresses over a cluster of peers; every
/// address stays installed on exactly one live, healthy peer.
#[derive(Parser, Debug)]
#[command(name = "hover", about = "High-availability manager for floating addresses", version, propagate_version = true)]
pub struct HoverCli {
    /// Host where the daemon to administer is running.
    #[arg(long, short = 'H', global = true, default_value = "localhost")]
    pub host: String,

    /// Port of the daemon (gossip and admin share it).
    #[arg(long, short = 'p', global = true, env = "HOVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Dump the HTTP exchange with the daemon to stderr.
    #[arg(long, short = 'D', global = true)]
    pub dump: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon.
    Run(RunArgs),
    /// Register a floating address (IFNAME:ADDRESS) with the cluster.
    AddAddress {
        /// The resource to add, e.g. `eth0:192.168.1.100`.
        resource: String,
    },
    /// Mark this peer administratively up.
    Up,
    /// Mark this peer administratively down.
    Down,
    /// List resources and where they are assigned.
    Status {
        /// Print peer names verbatim instead of just the host part.
        #[arg(long, short = 'n')]
        no_resolve: bool,
    },
    /// List peers and their liveness.
    Info {
        /// Print peer names verbatim instead of just the host part.
        #[arg(long, short = 'n')]
        no_resolve: bool,
    },
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Address to bind the gossip (UDP) and admin (TCP) listeners on.
    #[arg(long, short = 'a', env = "HOVER_LISTEN_ADDRESS")]
    pub listen_address: String,

    /// Gateway probed for upstream connectivity.
    #[arg(long, short = 'g', env = "HOVER_GATEWAY")]
    pub gateway: String,

    /// File the replicated map is persisted in.
    #[arg(long, short = 'd', env = "HOVER_DATA_FILE", default_value = "hover.data")]
    pub data_file: PathBuf,

    /// `host[:port]` of a running peer to attach to.
    #[arg(long, short = 's')]
    pub attach: Option<String>,

    /// Election priority for this peer. Lower wins; names break ties.
    #[arg(long, default_value_t = 0)]
    pub priority: i64,

    /// Treat a peer as dead when its phi score exceeds this.
    #[arg(long = "dead-at", default_value_t = 8.0)]
    pub dead_at: f64,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json.
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

/// Validates the `IFNAME:ADDRESS` shape of a resource, address included.
pub fn validate_resource(resource: &str) -> Result<(), String> {
    let Some((ifname, address)) = resource.split_once(':') else {
        return Err(format!("invalid resource format {:?}: expected IFNAME:ADDRESS", resource));
    };
    if ifname.is_empty() {
        return Err(format!("invalid resource format {:?}: empty interface name", resource));
    }
    if address.parse::<Ipv4Addr>().is_err() {
        return Err(format!("not a valid IPv4 address: {:?}", address));
    }
    Ok(())
}
