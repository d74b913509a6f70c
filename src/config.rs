use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServentConfig {
    /// Address other nodes know us by; also our self-identity.
    pub public_address: IpAddr,
    pub data_port: u16,
    pub discovery_port: u16,
    pub transfer_port: u16,
    /// HTTP status/callback surface, disabled when None.
    pub api_port: Option<u16>,
    pub connections_limit: usize,
    /// A firewalled node only dials out and serves files by push.
    pub firewalled: bool,
    pub shared_folder: PathBuf,
    pub cache_path: Option<PathBuf>,
    pub ping_interval: Duration,
    pub sender_poll_interval: Duration,
    pub read_timeout: Duration,
    pub reliable_threshold: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServentConfig {
    fn default() -> Self {
        ServentConfig {
            public_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            data_port: DEFAULT_DATA_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            api_port: None,
            connections_limit: DEFAULT_CONNECTIONS_LIMIT,
            firewalled: false,
            shared_folder: PathBuf::from("shared"),
            cache_path: Some(PathBuf::from("peers.json")),
            ping_interval: PING_INTERVAL,
            sender_poll_interval: SENDER_POLL_INTERVAL,
            read_timeout: READ_TIMEOUT,
            reliable_threshold: RELIABLE_THRESHOLD,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

impl ServentConfig {
    /// Defaults overlaid with SERVENT_* environment variables.
    ///
    ///   SERVENT_ADDRESS, SERVENT_DATA_PORT, SERVENT_DISCOVERY_PORT,
    ///   SERVENT_TRANSFER_PORT, SERVENT_API_PORT, SERVENT_LIMIT,
    ///   SERVENT_FIREWALLED, SERVENT_SHARED, SERVENT_CACHE,
    ///   SERVENT_PING_SECS, SERVENT_RELIABLE_SECS
    pub fn from_env() -> Self {
        let mut cfg = ServentConfig::default();
        if let Some(v) = env_parse("SERVENT_ADDRESS") {
            cfg.public_address = v;
        }
        if let Some(v) = env_parse("SERVENT_DATA_PORT") {
            cfg.data_port = v;
        }
        if let Some(v) = env_parse("SERVENT_DISCOVERY_PORT") {
            cfg.discovery_port = v;
        }
        if let Some(v) = env_parse("SERVENT_TRANSFER_PORT") {
            cfg.transfer_port = v;
        }
        if let Some(v) = env_parse("SERVENT_API_PORT") {
            cfg.api_port = Some(v);
        }
        if let Some(v) = env_parse("SERVENT_LIMIT") {
            cfg.connections_limit = v;
        }
        if let Some(v) = env_parse("SERVENT_FIREWALLED") {
            cfg.firewalled = v;
        }
        if let Ok(v) = std::env::var("SERVENT_SHARED") {
            cfg.shared_folder = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SERVENT_CACHE") {
            cfg.cache_path = if v.trim().is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = env_parse::<u64>("SERVENT_PING_SECS") {
            cfg.ping_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("SERVENT_RELIABLE_SECS") {
            cfg.reliable_threshold = Duration::from_secs(v);
        }
        cfg
    }

    /// Short intervals and OS-chosen ports, for nodes living inside one test process.
    pub fn ephemeral(shared_folder: PathBuf) -> Self {
        ServentConfig {
            data_port: 0,
            discovery_port: 0,
            transfer_port: 0,
            cache_path: None,
            shared_folder,
            ping_interval: Duration::from_millis(200),
            sender_poll_interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(100),
            reliable_threshold: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(2),
            ..ServentConfig::default()
        }
    }
}

impl ServentConfig {
    /// A listening node that calls itself loopback cannot recognise itself
    /// in Pongs carrying its LAN address, and may cache and dial itself.
    pub fn loopback_identity(&self) -> bool {
        !self.firewalled && self.public_address.is_loopback()
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("{} ignored (unparsable value {:?})", key, raw);
            None
        }
    }
}
