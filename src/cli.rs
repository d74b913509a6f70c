//! Command-line interface of `servent-node`.
//!
//! Flags overlay the `SERVENT_*` environment, which overlays the defaults.

use clap::{Args, Parser, Subcommand};
use servent_core::config::ServentConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "servent-node",
    about = "Peer-to-peer file discovery node",
    version,
    propagate_version = true
)]
pub struct ServentCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the overlay and serve until Ctrl+C.
    Run(NodeArgs),
    /// Join, run one search, print the results and leave.
    Search(SearchArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Address other peers know this node by.
    #[arg(long)]
    pub address: Option<IpAddr>,

    /// TCP port for overlay links (0 lets the OS choose).
    #[arg(long)]
    pub data_port: Option<u16>,

    /// UDP port for ping/pong discovery.
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// TCP port of the file server.
    #[arg(long)]
    pub transfer_port: Option<u16>,

    /// Port of the HTTP status API; also used as the directory callback.
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Maximum number of simultaneous links.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Do not listen; serve files by push only.
    #[arg(long)]
    pub firewalled: bool,

    /// Folder whose files are shared and where downloads land.
    #[arg(long)]
    pub shared: Option<PathBuf>,

    /// Peer cache file.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Peer to dial at startup, as address:data_port. Repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Base URL of a bootstrap directory.
    #[arg(long, env = "SERVENT_DIRECTORY")]
    pub directory: Option<String>,
}

impl NodeArgs {
    pub fn config(&self) -> ServentConfig {
        let mut cfg = ServentConfig::from_env();
        if let Some(v) = self.address {
            cfg.public_address = v;
        }
        if let Some(v) = self.data_port {
            cfg.data_port = v;
        }
        if let Some(v) = self.discovery_port {
            cfg.discovery_port = v;
        }
        if let Some(v) = self.transfer_port {
            cfg.transfer_port = v;
        }
        if self.api_port.is_some() {
            cfg.api_port = self.api_port;
        }
        if let Some(v) = self.limit {
            cfg.connections_limit = v;
        }
        if self.firewalled {
            cfg.firewalled = true;
        }
        if let Some(v) = &self.shared {
            cfg.shared_folder = v.clone();
        }
        if let Some(v) = &self.cache {
            cfg.cache_path = Some(v.clone());
        }
        cfg
    }
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Free-text query; split on whitespace into keywords.
    pub query: String,

    /// Seconds to wait for links and then for results.
    #[arg(long, default_value_t = 5)]
    pub wait: u64,

    /// Download the first result.
    #[arg(long)]
    pub download: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        ServentCli::command().debug_assert();
    }

    #[test]
    fn test_flags_overlay_config() {
        let cli = ServentCli::parse_from([
            "servent-node",
            "run",
            "--data-port",
            "7000",
            "--limit",
            "2",
            "--firewalled",
            "--peer",
            "10.0.0.2:6346",
            "--peer",
            "10.0.0.3:6346",
        ]);
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        let cfg = args.config();
        assert_eq!(cfg.data_port, 7000);
        assert_eq!(cfg.connections_limit, 2);
        assert!(cfg.firewalled);
        assert_eq!(args.peers.len(), 2);
    }
}
