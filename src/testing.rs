//! In-process doubles for exercising servents without touching disk.

use crate::config::ServentConfig;
use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::peer::PeerCache;
use crate::servent::Servent;
use crate::transfer::FileTransfer;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Fixed file list; pushes and fetches are recorded instead of streamed.
#[derive(Debug, Default)]
pub struct StaticFiles {
    files: Vec<String>,
    pushes: Mutex<Vec<(String, SocketAddr)>>,
    fetches: Mutex<Vec<(SocketAddr, String)>>,
}

impl StaticFiles {
    pub fn shared(files: &[&str]) -> Arc<Self> {
        Arc::new(StaticFiles {
            files: files.iter().map(|f| f.to_string()).collect(),
            ..StaticFiles::default()
        })
    }

    pub fn pushed(&self, push: &(String, SocketAddr)) -> bool {
        self.pushes.lock().unwrap().contains(push)
    }

    pub fn fetches(&self) -> Vec<(SocketAddr, String)> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileTransfer for StaticFiles {
    fn matches(&self, keywords: &[String]) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| keywords.iter().any(|k| f.to_lowercase().contains(&k.to_lowercase())))
            .cloned()
            .collect()
    }

    fn shared_files(&self) -> Vec<String> {
        self.files.clone()
    }

    async fn serve(&self, listener: TcpListener, halt: CancellationToken) {
        halt.cancelled().await;
        drop(listener);
    }

    async fn push(&self, file_name: &str, target: SocketAddr) -> Result<u64> {
        self.pushes.lock().unwrap().push((file_name.to_string(), target));
        Ok(0)
    }

    async fn fetch(&self, source: SocketAddr, file_name: &str) -> Result<u64> {
        self.fetches.lock().unwrap().push((source, file_name.to_string()));
        Ok(0)
    }
}

fn config(limit: usize, firewalled: bool) -> ServentConfig {
    let mut config = ServentConfig::ephemeral(std::env::temp_dir());
    config.connections_limit = limit;
    config.firewalled = firewalled;
    config
}

/// A servent that is never started, with links admitted to 10.0.0.x peers.
/// The links have no socket: whatever they would send stays in their outbox.
pub async fn linked_servent(
    limit: usize,
    firewalled: bool,
    files: &[&str],
    peers: &[(u8, u16)],
) -> (Arc<Servent>, Arc<StaticFiles>, Vec<Arc<ConnectionHandle>>) {
    let transfer = StaticFiles::shared(files);
    let servent = Servent::new(config(limit, firewalled), PeerCache::new(), transfer.clone());
    let mut links = Vec::new();
    for (last, data_port) in peers {
        let address = IpAddr::V4(Ipv4Addr::new(10, 0, 0, *last));
        let link = servent.admit_inbound(address, *data_port, data_port + 1).await.unwrap();
        links.push(link);
    }
    (servent, transfer, links)
}

/// A running servent on loopback with OS-chosen ports.
pub async fn started_node(limit: usize, firewalled: bool, files: &[&str]) -> (Arc<Servent>, Arc<StaticFiles>) {
    let transfer = StaticFiles::shared(files);
    let servent = Servent::new(config(limit, firewalled), PeerCache::new(), transfer.clone());
    servent.start().await.unwrap();
    (servent, transfer)
}

pub async fn wait_until<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
