// =============================================================================
// SERVENT CORE - connection.rs
// One TCP session per established peer
// =============================================================================
//
// Lifecycle: Pending -> Handshaking -> Active -> Closing -> Closed
//
// Frames are u32 BE length-delimited. The first frame in each direction is
// the handshake text line:
//   -> CONNECT <dataPort>,<discoveryPort>
//   <- ACCEPTED <discoveryPort> | REFUSED
// Every later frame carries one bincode Message.
//
// The receive loop handles Query / QueryHit / Push. Replies and relays are
// enqueued on the target connection's outbox and written by its own sender
// task, never from inside the receive loop.
// =============================================================================

use crate::constants::{ACCEPT_MARKER, CONNECT_MARKER, HANDSHAKE_TIMEOUT, MAX_FRAME_SIZE, REFUSE_MARKER};
use crate::error::{Result, ServentError};
use crate::message::{Message, Payload};
use crate::peer::{PeerKey, SharedPeer};
use crate::router::{self, ConnectionId, Outbox, Route, Router, RoutingTable};
use crate::servent::Servent;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

fn framed(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (FramedRead::new(read, codec()), FramedWrite::new(write, codec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Handshaking,
    Active,
    Closing,
    Closed,
}

// ---- Handshake lines --------------------------------------------------------

pub fn connect_line(data_port: u16, discovery_port: u16) -> String {
    format!("{} {},{}", CONNECT_MARKER, data_port, discovery_port)
}

pub fn accept_line(discovery_port: u16) -> String {
    format!("{} {}", ACCEPT_MARKER, discovery_port)
}

/// `CONNECT <data>,<discovery>` -> (data, discovery). Anything else is a violation.
pub fn parse_connect(line: &str) -> Option<(u16, u16)> {
    let (marker, ports) = line.trim().split_once(' ')?;
    if marker != CONNECT_MARKER {
        return None;
    }
    let fields: Vec<&str> = ports.split(',').collect();
    if fields.len() != 2 {
        return None;
    }
    let data = fields[0].trim().parse().ok()?;
    let discovery = fields[1].trim().parse().ok()?;
    Some((data, discovery))
}

/// `ACCEPTED <discovery>` -> discovery port. `REFUSED` and garbage give None.
pub fn parse_accept(line: &str) -> Option<u16> {
    let (marker, port) = line.trim().split_once(' ')?;
    if marker != ACCEPT_MARKER {
        return None;
    }
    port.trim().parse().ok()
}

/// The dialer's reading of the answer to its CONNECT line.
pub fn parse_reply(line: &str, peer: &str) -> Result<u16> {
    if line.trim() == REFUSE_MARKER {
        return Err(ServentError::Refused(peer.to_string()));
    }
    parse_accept(line).ok_or_else(|| ServentError::Handshake(format!("unexpected answer {:?}", line)))
}

async fn read_text(reader: &mut FrameReader) -> Result<String> {
    let frame = match timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
        Err(_) => return Err(ServentError::Handshake("timed out".into())),
        Ok(None) => return Err(ServentError::Handshake("closed before handshake".into())),
        Ok(Some(frame)) => frame?,
    };
    String::from_utf8(frame.to_vec()).map_err(|e| ServentError::Handshake(e.to_string()))
}

async fn write_text(writer: &mut FrameWriter, line: &str) -> Result<()> {
    writer.send(Bytes::from(line.to_string())).await?;
    Ok(())
}

// -----------------------------------------------------------------------------
// ConnectionHandle
// -----------------------------------------------------------------------------

/// The shared face of a connection: what other components route through.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SharedPeer,
    /// The servent's query table; reverse routes are shared node-wide.
    routes: Arc<RoutingTable>,
    outbox: Outbox,
    writer: Mutex<Option<FrameWriter>>,
    state: Mutex<ConnectionState>,
    closing: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: SharedPeer, routes: Arc<RoutingTable>, closing: CancellationToken) -> Self {
        ConnectionHandle {
            id,
            peer,
            routes,
            outbox: Outbox::new(),
            writer: Mutex::new(None),
            state: Mutex::new(ConnectionState::Pending),
            closing,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &SharedPeer {
        &self.peer
    }

    pub fn key(&self) -> PeerKey {
        self.peer.key()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.lock().await = state;
    }

    /// Moves to Closing unless already there. False means someone else tears down.
    async fn begin_closing(&self) -> bool {
        let mut state = self.state.lock().await;
        if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
            return false;
        }
        *state = ConnectionState::Closing;
        true
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Asks the receive loop to exit; teardown follows.
    pub fn close(&self) {
        self.closing.cancel();
    }

    async fn attach(&self, writer: FrameWriter) {
        *self.writer.lock().await = Some(writer);
    }

    pub(crate) async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = SinkExt::<Bytes>::close(&mut writer).await;
        }
    }
}

#[async_trait]
impl Router for ConnectionHandle {
    fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    async fn send(&self, message: Message, _route: Route) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Could not encode {}: {}", message, e);
                return;
            }
        };
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            log::debug!("{} to {} dropped: socket not attached", message, self.peer);
            return;
        };
        if let Err(e) = writer.send(Bytes::from(bytes)).await {
            log::warn!("Write to {} failed: {}", self.peer, e);
            self.closing.cancel();
        }
    }
}

// -----------------------------------------------------------------------------
// ConnectionSet
// -----------------------------------------------------------------------------

/// Active connections, indexed by id and by peer identity.
#[derive(Debug)]
pub struct ConnectionSet {
    limit: usize,
    by_id: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_peer: HashMap<PeerKey, ConnectionId>,
}

impl ConnectionSet {
    pub fn new(limit: usize) -> Self {
        ConnectionSet {
            limit,
            by_id: HashMap::new(),
            by_peer: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.by_id.len() >= self.limit
    }

    /// Admission check and insertion in one step, so the limit holds at every instant.
    pub fn try_admit(&mut self, handle: Arc<ConnectionHandle>) -> Result<()> {
        if self.is_full() {
            return Err(ServentError::LimitReached(self.limit));
        }
        let key = handle.key();
        if self.by_peer.contains_key(&key) {
            return Err(ServentError::AlreadyConnected(key.to_string()));
        }
        self.by_peer.insert(key, handle.id());
        self.by_id.insert(handle.id(), handle);
        Ok(())
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let handle = self.by_id.remove(&id)?;
        self.by_peer.remove(&handle.key());
        Some(handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.by_id.get(&id).cloned()
    }

    pub fn find(&self, key: &PeerKey) -> Option<Arc<ConnectionHandle>> {
        self.by_peer.get(key).and_then(|id| self.get(*id))
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.by_id.values().cloned().collect()
    }
}

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

/// The receive side of a session, bound to the servent that owns it.
pub struct Connection {
    servent: Arc<Servent>,
    handle: Arc<ConnectionHandle>,
}

/// Inbound side: the remote dialed our data port.
pub async fn accept(servent: Arc<Servent>, stream: TcpStream, remote: SocketAddr) {
    let port = servent.data_port();
    let (mut reader, mut writer) = framed(stream);

    let line = match read_text(&mut reader).await {
        Ok(line) => line,
        Err(e) => {
            log::debug!("[:{}] Handshake from {} failed: {}", port, remote, e);
            return;
        }
    };
    let Some((data_port, discovery_port)) = parse_connect(&line) else {
        log::debug!("[:{}] Malformed handshake from {}: {:?}", port, remote, line);
        return;
    };

    let handle = match servent.admit_inbound(remote.ip(), data_port, discovery_port).await {
        Ok(handle) => handle,
        Err(reason) => {
            log::info!("[:{}] ⛔ Refused {}:{} ({})", port, remote.ip(), data_port, reason);
            let _ = write_text(&mut writer, REFUSE_MARKER).await;
            return;
        }
    };
    handle.set_state(ConnectionState::Handshaking).await;

    let connection = Connection::new(servent, handle);
    let reply = accept_line(connection.servent.discovery_port());
    if let Err(e) = write_text(&mut writer, &reply).await {
        log::warn!("[:{}] Handshake reply to {} failed: {}", port, remote, e);
        connection.teardown(false).await;
        return;
    }
    log::info!("[:{}] 🤝 Accepted {}", port, connection.handle.peer);
    connection.run(reader, writer).await;
}

/// Outbound side. The caller has already claimed `peer`; the claim is
/// released on every failure path.
pub async fn dial(servent: Arc<Servent>, peer: SharedPeer) {
    let port = servent.data_port();
    let (mut reader, mut writer) = match TcpStream::connect(peer.key().data_addr()).await {
        Ok(stream) => framed(stream),
        Err(e) => {
            log::debug!("[:{}] Could not reach {}: {}", port, peer, e);
            peer.release();
            return;
        }
    };

    let request = connect_line(port, servent.discovery_port());
    let answer = match write_text(&mut writer, &request).await {
        Ok(()) => read_text(&mut reader).await,
        Err(e) => Err(e),
    };
    let discovery_port = match answer.and_then(|line| parse_reply(&line, &peer.to_string())) {
        Ok(discovery_port) => discovery_port,
        Err(e @ ServentError::Refused(_)) => {
            log::info!("[:{}] ⛔ {}", port, e);
            peer.release();
            return;
        }
        Err(e) => {
            log::debug!("[:{}] Handshake with {} failed: {}", port, peer, e);
            peer.release();
            return;
        }
    };
    peer.set_discovery_port(discovery_port);

    let handle = match servent.register(Arc::clone(&peer)).await {
        Ok(handle) => handle,
        Err(e) => {
            log::info!("[:{}] Dropping link to {}: {}", port, peer, e);
            peer.release();
            return;
        }
    };
    handle.set_state(ConnectionState::Handshaking).await;
    log::info!("[:{}] 🔌 Connected to {}", port, peer);
    Connection::new(servent, handle).run(reader, writer).await;
}

impl Connection {
    pub fn new(servent: Arc<Servent>, handle: Arc<ConnectionHandle>) -> Self {
        Connection { servent, handle }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    fn origin(&self) -> Route {
        Route::Peer(self.handle.id)
    }

    async fn run(self, mut reader: FrameReader, writer: FrameWriter) {
        self.handle.attach(writer).await;
        self.handle.set_state(ConnectionState::Active).await;

        let poll = self.servent.config().sender_poll_interval;
        let sender = tokio::spawn(router::drain(
            Arc::clone(&self.handle),
            poll,
            self.handle.closing.clone(),
        ));

        let read_timeout = self.servent.config().read_timeout;
        let mut unreachable = false;
        loop {
            let next = tokio::select! {
                _ = self.handle.closing.cancelled() => break,
                next = timeout(read_timeout, reader.next()) => next,
            };
            let frame = match next {
                // read timeout: go round and look at the flags again
                Err(_) => continue,
                Ok(None) => {
                    unreachable = true;
                    break;
                }
                Ok(Some(Err(e))) => {
                    log::debug!("Read from {} failed: {}", self.handle.peer, e);
                    unreachable = true;
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            self.handle.peer.touch();
            match Message::decode(&frame) {
                Ok(message) => self.dispatch(message).await,
                Err(e) => log::debug!("Undecodable frame from {} skipped: {}", self.handle.peer, e),
            }
        }

        self.handle.closing.cancel();
        let _ = sender.await;
        self.teardown(unreachable).await;
    }

    pub async fn dispatch(&self, message: Message) {
        match &message.payload {
            Payload::Query(_) => self.on_query(message).await,
            Payload::QueryHit(_) => self.on_query_hit(message).await,
            Payload::Push(_) => self.on_push(message).await,
            _ => log::debug!("{} ignored on the data link", message),
        }
    }

    async fn on_query(&self, message: Message) {
        let origin = self.origin();
        if !self.servent.routes().record_if_new(message.id, origin).await {
            log::debug!("Duplicate {} from {} dropped", message, self.handle.peer);
            return;
        }
        let Payload::Query(query) = &message.payload else {
            return;
        };

        let mut flood = message.clone();
        if flood.prepare_forward().is_alive() {
            self.servent.forward(flood, origin).await;
        } else {
            log::debug!("{} is dead, not flooded", message);
        }

        let matches = self.servent.transfer().matches(&query.keywords);
        if matches.is_empty() {
            return;
        }
        log::info!(
            "[:{}] 🔎 {:?} matches {} local file(s)",
            self.servent.data_port(),
            query.keywords,
            matches.len()
        );
        let firewalled = self.servent.is_firewalled();
        let hit = Message::query_hit(message.id, matches, self.servent.transfer_port(), firewalled);
        self.handle.forward(hit, origin).await;
        if firewalled {
            self.servent.push_routes().record(message.id, Route::Local).await;
        }
    }

    async fn on_query_hit(&self, mut message: Message) {
        let Some(destination) = self.servent.destination_for(&message.id).await else {
            log::debug!("{} has no reverse route, dropped", message);
            return;
        };
        let Payload::QueryHit(hit) = &mut message.payload else {
            return;
        };
        if hit.address.is_none() {
            hit.address = Some(self.handle.peer.address());
        }
        let firewalled = hit.firewalled;

        match destination {
            Route::Local => {
                if firewalled && self.servent.is_firewalled() {
                    log::info!("Hit {} dropped: both ends are firewalled", message.id);
                    return;
                }
                let Some(session) = self.servent.session(&message.id).await else {
                    return;
                };
                let added = session.add_hit(message.id, hit).await;
                log::info!("[:{}] 📬 {} result(s) for search {}", self.servent.data_port(), added, message.id);
                if firewalled {
                    self.servent.push_routes().record(message.id, self.origin()).await;
                }
            }
            Route::Peer(target) => {
                if firewalled {
                    self.servent.push_routes().record(message.id, self.origin()).await;
                }
                if !message.prepare_forward().is_alive() {
                    log::debug!("{} is dead, not relayed", message);
                    return;
                }
                match self.servent.connection(target).await {
                    Some(next) => next.forward(message, destination).await,
                    None => log::debug!("Reverse route {} for {} is gone", target, message),
                }
            }
        }
    }

    async fn on_push(&self, mut message: Message) {
        let Some(route) = self.servent.push_routes().destination(&message.id).await else {
            log::debug!("{} has no push route, dropped", message);
            return;
        };
        let Payload::Push(push) = &mut message.payload else {
            return;
        };
        if push.target.is_none() {
            push.target = Some(self.handle.peer.address());
        }

        match route {
            Route::Local if self.servent.is_firewalled() => self.servent.serve_push(push.clone()).await,
            Route::Local => log::debug!("{} for a reachable node ignored", message),
            Route::Peer(id) => match self.servent.connection(id).await {
                Some(next) => next.forward(message, route).await,
                None => log::debug!("Push route {} for {} is gone", id, message),
            },
        }
    }

    async fn teardown(&self, unreachable: bool) {
        if !self.handle.begin_closing().await {
            return;
        }
        let peer = &self.handle.peer;
        self.servent.unregister(self.handle.id).await;
        if unreachable && !self.servent.is_halting() {
            self.servent.evict(&peer.key()).await;
        }
        peer.release();
        self.handle.closing.cancel();
        self.handle.detach().await;
        self.handle.set_state(ConnectionState::Closed).await;
        log::info!("[:{}] 👋 Connection with {} closed", self.servent.data_port(), peer);

        if !self.servent.is_halting() {
            self.servent.replenish().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerDescriptor;
    use std::net::{IpAddr, Ipv4Addr};

    fn handle(id: ConnectionId, last_octet: u8, port: u16) -> Arc<ConnectionHandle> {
        let peer = PeerDescriptor::shared(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port, 0);
        Arc::new(ConnectionHandle::new(
            id,
            peer,
            Arc::new(RoutingTable::new()),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_parse_connect() {
        assert_eq!(parse_connect("CONNECT 6000,6001"), Some((6000, 6001)));
        assert_eq!(parse_connect("CONNECT 6000, 6001\n"), Some((6000, 6001)));
        assert_eq!(parse_connect("CONNECT 6000"), None);
        assert_eq!(parse_connect("CONNECT 6000,6001,6002"), None);
        assert_eq!(parse_connect("CONNECT a,b"), None);
        assert_eq!(parse_connect("CONNECT 70000,1"), None);
        assert_eq!(parse_connect("HELLO 6000,6001"), None);
        assert_eq!(parse_connect(""), None);
    }

    #[test]
    fn test_parse_accept() {
        assert_eq!(parse_accept(&accept_line(6347)), Some(6347));
        assert_eq!(parse_accept(REFUSE_MARKER), None);
        assert_eq!(parse_accept("ACCEPTED"), None);
        assert_eq!(parse_accept("ACCEPTED x"), None);
    }

    #[test]
    fn test_handshake_lines_roundtrip() {
        assert_eq!(parse_connect(&connect_line(1, 2)), Some((1, 2)));
    }

    #[test]
    fn test_set_respects_limit() {
        let mut set = ConnectionSet::new(2);
        set.try_admit(handle(1, 1, 6000)).unwrap();
        set.try_admit(handle(2, 2, 6000)).unwrap();
        assert!(set.is_full());
        assert!(matches!(
            set.try_admit(handle(3, 3, 6000)),
            Err(ServentError::LimitReached(2))
        ));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_one_link_per_peer() {
        let mut set = ConnectionSet::new(4);
        set.try_admit(handle(1, 1, 6000)).unwrap();
        assert!(matches!(
            set.try_admit(handle(2, 1, 6000)),
            Err(ServentError::AlreadyConnected(_))
        ));
        // same address, other data port: a different peer
        set.try_admit(handle(3, 1, 6001)).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_remove_clears_index() {
        let mut set = ConnectionSet::new(4);
        let h = handle(7, 9, 6000);
        let key = h.key();
        set.try_admit(h).unwrap();
        assert_eq!(set.find(&key).map(|h| h.id()), Some(7));
        assert!(set.remove(7).is_some());
        assert!(set.find(&key).is_none());
        assert!(set.remove(7).is_none());
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_reply_tells_refusal_from_garbage() {
        assert_eq!(parse_reply(&accept_line(6347), "10.0.0.1:6000").unwrap(), 6347);
        assert!(matches!(
            parse_reply(REFUSE_MARKER, "10.0.0.1:6000"),
            Err(ServentError::Refused(peer)) if peer == "10.0.0.1:6000"
        ));
        assert!(matches!(parse_reply("HELLO", "x"), Err(ServentError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_detached_handle_drops_sends() {
        let h = handle(1, 1, 6000);
        h.send(Message::ping(1, 2), Route::Peer(1)).await;
        assert!(!h.is_closing());
        h.close();
        assert!(h.is_closing());
    }

    #[tokio::test]
    async fn test_closing_happens_once() {
        let h = handle(1, 1, 6000);
        assert!(h.begin_closing().await);
        assert!(!h.begin_closing().await);
        h.set_state(ConnectionState::Closed).await;
        assert!(!h.begin_closing().await);
    }

    #[tokio::test]
    async fn test_detach_closes_the_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_reader, writer) = framed(client.unwrap());
        let (mut remote, _) = framed(server.unwrap().0);

        let h = handle(1, 1, 6000);
        h.attach(writer).await;
        h.send(Message::ping(1, 2), Route::Peer(1)).await;
        let frame = remote.next().await.unwrap().unwrap();
        assert!(matches!(Message::decode(&frame).unwrap().payload, Payload::Ping(_)));

        h.detach().await;
        assert!(remote.next().await.is_none());
        h.send(Message::ping(1, 2), Route::Peer(1)).await;
        assert!(!h.is_closing());
    }
}
