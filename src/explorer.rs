// =============================================================================
// SERVENT CORE - explorer.rs
// UDP topology discovery (Ping / Pong)
// =============================================================================
//
// Two loops share one socket:
//   generator - every ping_interval, one fresh Ping per active connection
//   receiver  - answers Pings with Pongs, relays both along the overlay,
//               learns new peers from the Pongs it sees
// plus the usual outbox drain. Each datagram carries exactly one message.
//
// Pings are only accepted from peers we hold a connection with; that is how
// a Pong finds its way back: each hop answers and relays on its own links.
// =============================================================================

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::message::{Message, Payload};
use crate::peer::PeerKey;
use crate::router::{self, Outbox, Route, Router, RoutingTable};
use crate::servent::Servent;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub struct NetworkExplorer {
    servent: Arc<Servent>,
    socket: UdpSocket,
    routes: RoutingTable,
    outbox: Outbox,
}

impl NetworkExplorer {
    pub fn new(servent: Arc<Servent>, socket: UdpSocket) -> Arc<Self> {
        Arc::new(NetworkExplorer {
            servent,
            socket,
            routes: RoutingTable::new(),
            outbox: Outbox::new(),
        })
    }

    /// Spawns receiver, generator and sender; all stop on `halt`.
    pub fn spawn(self: &Arc<Self>, halt: CancellationToken) -> Vec<JoinHandle<()>> {
        let poll = self.servent.config().sender_poll_interval;
        vec![
            tokio::spawn(Arc::clone(self).receive_loop(halt.clone())),
            tokio::spawn(Arc::clone(self).ping_loop(halt.clone())),
            tokio::spawn(router::drain(Arc::clone(self), poll, halt)),
        ]
    }

    async fn receive_loop(self: Arc<Self>, halt: CancellationToken) {
        if let Ok(addr) = self.socket.local_addr() {
            log::info!("[:{}] 🛰️  Discovery listening on {}", self.servent.data_port(), addr);
        }
        let read_timeout = self.servent.config().read_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                _ = halt.cancelled() => break,
                r = timeout(read_timeout, self.socket.recv_from(&mut buf)) => r,
            };
            let (len, source) = match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    log::debug!("Discovery receive error: {}", e);
                    continue;
                }
                Ok(Ok(datagram)) => datagram,
            };
            match Message::decode(&buf[..len]) {
                Ok(message) => self.handle_datagram(message, source).await,
                Err(e) => log::debug!("Undecodable datagram from {} skipped: {}", source, e),
            }
        }
        log::info!("[:{}] Discovery stopped", self.servent.data_port());
    }

    async fn ping_loop(self: Arc<Self>, halt: CancellationToken) {
        let interval = self.servent.config().ping_interval;
        loop {
            self.ping_all().await;
            tokio::select! {
                _ = halt.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One fresh Ping per active connection.
    pub async fn ping_all(&self) {
        let (data_port, discovery_port) = self.servent.local_ports();
        for conn in self.servent.connections_snapshot().await {
            let ping = Message::ping(data_port, discovery_port);
            self.record_seen(ping.id, Route::Local).await;
            self.forward(ping, Route::Peer(conn.id())).await;
        }
    }

    pub async fn handle_datagram(&self, message: Message, source: SocketAddr) {
        match &message.payload {
            Payload::Ping(_) => self.on_ping(message, source).await,
            Payload::Pong(_) => self.on_pong(message, source).await,
            _ => log::debug!("{} from {} ignored on discovery", message, source),
        }
    }

    async fn on_ping(&self, mut message: Message, source: SocketAddr) {
        if self.has_seen(&message.id).await {
            log::debug!("Duplicate {} from {} dropped", message, source);
            return;
        }
        let Payload::Ping(ping) = &message.payload else {
            return;
        };
        let key = PeerKey::new(source.ip(), ping.data_port);
        let Some(origin) = self.servent.connection_to(&key).await else {
            log::debug!("{} from non-peer {} dropped", message, key);
            return;
        };
        let origin_route = Route::Peer(origin.id());
        self.record_seen(message.id, origin_route).await;

        let (data_port, discovery_port) = self.servent.local_ports();
        self.forward(Message::pong(message.id, data_port, discovery_port), origin_route)
            .await;

        if !message.prepare_forward().is_alive() {
            log::debug!("{} is dead, not flooded", message);
            return;
        }
        if let Payload::Ping(ping) = &mut message.payload {
            ping.data_port = data_port;
            ping.discovery_port = discovery_port;
        }
        for conn in self.servent.connections_snapshot().await {
            if conn.id() != origin.id() {
                self.forward(message.clone(), Route::Peer(conn.id())).await;
            }
        }
    }

    async fn on_pong(&self, mut message: Message, source: SocketAddr) {
        let Payload::Pong(pong) = &mut message.payload else {
            return;
        };
        let address = *pong.address.get_or_insert(source.ip());
        let key = PeerKey::new(address, pong.data_port);
        let discovery_port = pong.discovery_port;
        self.servent.discovered(key, discovery_port).await;

        match self.destination_for(&message.id).await {
            Some(route @ Route::Peer(_)) => {
                if message.prepare_forward().is_alive() {
                    self.forward(message, route).await;
                } else {
                    log::debug!("{} is dead, not relayed", message);
                }
            }
            Some(Route::Local) => {}
            None => log::debug!("{} has no reverse route", message),
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending(&self) -> Vec<(Message, Route)> {
        self.outbox.drain_all().await
    }
}

#[async_trait]
impl Router for NetworkExplorer {
    fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    async fn send(&self, message: Message, route: Route) {
        let Route::Peer(id) = route else {
            return;
        };
        let Some(target) = self.servent.connection(id).await.and_then(|c| c.peer().discovery_addr()) else {
            log::debug!("{} dropped: no discovery address for connection {}", message, id);
            return;
        };
        let bytes = match message.encode() {
            Ok(bytes) if bytes.len() <= MAX_DATAGRAM_SIZE => bytes,
            Ok(bytes) => {
                log::warn!("{} is {} bytes, too large for one datagram", message, bytes.len());
                return;
            }
            Err(e) => {
                log::warn!("Could not encode {}: {}", message, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, target).await {
            log::debug!("Datagram to {} failed: {}", target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServentConfig;
    use crate::peer::PeerCache;
    use crate::testing::StaticFiles;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    async fn explorer_with_links(limit: usize, peers: &[(u8, u16, u16)]) -> (Arc<Servent>, Arc<NetworkExplorer>) {
        let mut config = ServentConfig::ephemeral(std::env::temp_dir());
        config.connections_limit = limit;
        let servent = Servent::new(config, PeerCache::new(), StaticFiles::shared(&[]));
        for (last, data, discovery) in peers {
            servent.admit_inbound(ip(*last), *data, *discovery).await.unwrap();
        }
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let explorer = NetworkExplorer::new(Arc::clone(&servent), socket);
        (servent, explorer)
    }

    #[tokio::test]
    async fn test_ping_from_peer_is_answered_and_flooded() {
        let (servent, explorer) = explorer_with_links(4, &[(2, 6000, 6001), (3, 6000, 6001), (4, 6000, 6001)]).await;
        let origin = servent.connection_to(&PeerKey::new(ip(2), 6000)).await.unwrap();

        let ping = Message::ping(6000, 6001);
        let id = ping.id;
        explorer.handle_datagram(ping, SocketAddr::new(ip(2), 6001)).await;

        let sent = explorer.pending().await;
        assert_eq!(sent.len(), 3);
        let (pong, back) = &sent[0];
        assert_eq!(pong.id, id);
        assert!(matches!(pong.payload, Payload::Pong(_)));
        assert_eq!(*back, Route::Peer(origin.id()));

        let (data_port, discovery_port) = servent.local_ports();
        for (relayed, route) in &sent[1..] {
            assert_ne!(*route, Route::Peer(origin.id()));
            assert_eq!(relayed.ttl, crate::constants::DEFAULT_TTL - 1);
            let Payload::Ping(p) = &relayed.payload else { panic!("expected a ping") };
            assert_eq!((p.data_port, p.discovery_port), (data_port, discovery_port));
        }
        assert_eq!(explorer.destination_for(&id).await, Some(Route::Peer(origin.id())));
    }

    #[tokio::test]
    async fn test_ping_from_stranger_or_twice_is_dropped() {
        let (_servent, explorer) = explorer_with_links(4, &[(2, 6000, 6001)]).await;

        explorer
            .handle_datagram(Message::ping(7000, 7001), SocketAddr::new(ip(9), 7001))
            .await;
        assert!(explorer.pending().await.is_empty());

        let ping = Message::ping(6000, 6001);
        explorer.handle_datagram(ping.clone(), SocketAddr::new(ip(2), 6001)).await;
        assert_eq!(explorer.pending().await.len(), 1);
        explorer.handle_datagram(ping, SocketAddr::new(ip(2), 6001)).await;
        assert!(explorer.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_pong_teaches_cache_and_follows_reverse_route() {
        let (servent, explorer) = explorer_with_links(1, &[(2, 6000, 6001)]).await;
        let origin = servent.connection_to(&PeerKey::new(ip(2), 6000)).await.unwrap();

        let ping = Message::ping(6000, 6001);
        explorer.record_seen(ping.id, Route::Peer(origin.id())).await;
        let pong = Message::pong(ping.id, 6100, 6101);
        explorer.handle_datagram(pong, SocketAddr::new(ip(5), 6101)).await;

        // limit is 1, so the newcomer is only remembered
        assert!(servent.cache_contains(&PeerKey::new(ip(5), 6100)).await);
        assert_eq!(servent.connection_count().await, 1);

        let sent = explorer.pending().await;
        assert_eq!(sent.len(), 1);
        let (relayed, route) = &sent[0];
        assert_eq!(*route, Route::Peer(origin.id()));
        let Payload::Pong(p) = &relayed.payload else { panic!("expected a pong") };
        assert_eq!(p.address, Some(ip(5)));
    }

    #[tokio::test]
    async fn test_ping_all_records_local_origin() {
        let (_servent, explorer) = explorer_with_links(4, &[(2, 6000, 6001), (3, 6000, 6001)]).await;
        explorer.ping_all().await;
        let sent = explorer.pending().await;
        assert_eq!(sent.len(), 2);
        for (ping, _) in &sent {
            assert_eq!(explorer.destination_for(&ping.id).await, Some(Route::Local));
        }
    }

    #[tokio::test]
    async fn test_datagram_goes_to_discovery_port_unless_oversized() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let discovery_port = remote.local_addr().unwrap().port();
        let servent = Servent::new(
            ServentConfig::ephemeral(std::env::temp_dir()),
            PeerCache::new(),
            StaticFiles::shared(&[]),
        );
        let link = servent
            .admit_inbound(IpAddr::V4(Ipv4Addr::LOCALHOST), 6000, discovery_port)
            .await
            .unwrap();
        let explorer = NetworkExplorer::new(Arc::clone(&servent), UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let ping = Message::ping(6000, 6001);
        explorer.send(ping.clone(), Route::Peer(link.id())).await;
        let mut buf = vec![0u8; 4 * MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(&buf[..len]).unwrap().id, ping.id);

        let bulky = Message::query(vec!["x".repeat(MAX_DATAGRAM_SIZE)]);
        assert!(bulky.encode().unwrap().len() > MAX_DATAGRAM_SIZE);
        explorer.send(bulky, Route::Peer(link.id())).await;
        assert!(timeout(Duration::from_millis(300), remote.recv_from(&mut buf)).await.is_err());
    }
}
