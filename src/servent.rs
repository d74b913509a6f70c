// =============================================================================
// SERVENT CORE - servent.rs
// The node: admission, search, download, bootstrap, reliability, shutdown
// =============================================================================
//
// Lifecycle: Created -> Starting -> Running -> ShuttingDown -> Stopped
//
// The servent owns every piece of shared state:
//   cache        - known peers (persisted)
//   connections  - active links, at most connections_limit
//   queries      - Query / QueryHit reverse routes, shared with connections
//   push_routes  - QueryHit identity -> link a Push must take
//   searches     - running SearchSessions
//
// Lock order: cache before connections. Nothing holds the connections lock
// while taking the cache lock.
//
// As a Router, the servent floods: send(message, origin) enqueues the message
// on every link except the one it came from.
// =============================================================================

use crate::api;
use crate::config::ServentConfig;
use crate::connection::{self, ConnectionHandle, ConnectionSet};
use crate::constants::reliable_refresh;
use crate::directory::BootstrapDirectory;
use crate::error::{Result, ServentError};
use crate::explorer::NetworkExplorer;
use crate::message::{Message, MessageId, Push};
use crate::peer::{PeerCache, PeerKey, PeerRecord, SharedPeer};
use crate::router::{self, ConnectionId, Outbox, Route, Router, RoutingTable};
use crate::search::{SearchResult, SearchSession};
use crate::transfer::FileTransfer;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// What `download` did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Fetched directly from the holder.
    Fetched(u64),
    /// Holder is firewalled: a Push left over this link.
    PushRequested(ConnectionId),
}

pub struct Servent {
    config: ServentConfig,
    transfer: Arc<dyn FileTransfer>,

    cache: Mutex<PeerCache>,
    connections: Mutex<ConnectionSet>,
    queries: Arc<RoutingTable>,
    push_routes: RoutingTable,
    searches: Mutex<HashMap<MessageId, Arc<SearchSession>>>,
    outbox: Outbox,
    directories: Mutex<Vec<Arc<dyn BootstrapDirectory>>>,

    state: Mutex<Lifecycle>,
    halt: CancellationToken,
    data_port: AtomicU16,
    discovery_port: AtomicU16,
    transfer_port: AtomicU16,
    next_connection: AtomicU64,
    started_at: OnceLock<Instant>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    links: Mutex<JoinSet<()>>,
}

impl Servent {
    pub fn new(config: ServentConfig, cache: PeerCache, transfer: Arc<dyn FileTransfer>) -> Arc<Self> {
        Arc::new(Servent {
            data_port: AtomicU16::new(config.data_port),
            discovery_port: AtomicU16::new(config.discovery_port),
            transfer_port: AtomicU16::new(config.transfer_port),
            connections: Mutex::new(ConnectionSet::new(config.connections_limit)),
            config,
            transfer,
            cache: Mutex::new(cache),
            queries: Arc::new(RoutingTable::new()),
            push_routes: RoutingTable::new(),
            searches: Mutex::new(HashMap::new()),
            outbox: Outbox::new(),
            directories: Mutex::new(Vec::new()),
            state: Mutex::new(Lifecycle::Created),
            halt: CancellationToken::new(),
            next_connection: AtomicU64::new(1),
            started_at: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            links: Mutex::new(JoinSet::new()),
        })
    }

    // ---- Accessors ------------------------------------------------------

    pub fn config(&self) -> &ServentConfig {
        &self.config
    }

    pub fn transfer(&self) -> &Arc<dyn FileTransfer> {
        &self.transfer
    }

    pub fn push_routes(&self) -> &RoutingTable {
        &self.push_routes
    }

    pub fn is_firewalled(&self) -> bool {
        self.config.firewalled
    }

    pub fn is_halting(&self) -> bool {
        self.halt.is_cancelled()
    }

    pub fn data_port(&self) -> u16 {
        self.data_port.load(Ordering::Relaxed)
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port.load(Ordering::Relaxed)
    }

    pub fn transfer_port(&self) -> u16 {
        self.transfer_port.load(Ordering::Relaxed)
    }

    /// (data, discovery) as advertised in Ping and Pong.
    pub fn local_ports(&self) -> (u16, u16) {
        (self.data_port(), self.discovery_port())
    }

    /// This node as the overlay sees it. Fixed once the listener is bound.
    pub fn self_key(&self) -> PeerKey {
        PeerKey::new(self.config.public_address, self.data_port())
    }

    pub async fn state(&self) -> Lifecycle {
        *self.state.lock().await
    }

    // ---- Lifecycle ------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != Lifecycle::Created {
                return Err(ServentError::Lifecycle(format!("{:?}, cannot start again", *state)));
            }
            *state = Lifecycle::Starting;
        }
        let _ = self.started_at.set(Instant::now());

        if let Err(e) = self.launch().await {
            log::error!("❌ Servent could not start: {}", e);
            self.halt.cancel();
            for task in self.tasks.lock().await.drain(..) {
                task.abort();
            }
            *self.state.lock().await = Lifecycle::Stopped;
            return Err(e);
        }

        *self.state.lock().await = Lifecycle::Running;
        log::info!(
            "[:{}] ✅ Servent running (discovery :{}, files :{}, limit {}{})",
            self.data_port(),
            self.discovery_port(),
            self.transfer_port(),
            self.config.connections_limit,
            if self.is_firewalled() { ", firewalled" } else { "" }
        );
        self.replenish().await;
        Ok(())
    }

    async fn launch(self: &Arc<Self>) -> Result<()> {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let poll = self.config.sender_poll_interval;
        self.track(tokio::spawn(router::drain(Arc::clone(self), poll, self.halt.clone())))
            .await;

        if self.is_firewalled() {
            log::info!("🧱 Firewalled: no listener, dialing out only");
        } else {
            let listener = TcpListener::bind((any, self.config.data_port)).await?;
            self.data_port.store(listener.local_addr()?.port(), Ordering::Relaxed);
            let socket = UdpSocket::bind((any, self.config.discovery_port)).await?;
            self.discovery_port.store(socket.local_addr()?.port(), Ordering::Relaxed);
            let files = TcpListener::bind((any, self.config.transfer_port)).await?;
            self.transfer_port.store(files.local_addr()?.port(), Ordering::Relaxed);
            log::info!("[:{}] 📡 Listening for peers", self.data_port());
            if self.config.loopback_identity() {
                log::warn!(
                    "[:{}] ⚠️  Public address is {} but every interface listens; set --address to the LAN address",
                    self.data_port(),
                    self.config.public_address
                );
            }

            for task in NetworkExplorer::new(Arc::clone(self), socket).spawn(self.halt.clone()) {
                self.track(task).await;
            }
            self.track(tokio::spawn(Arc::clone(self).reliability_loop())).await;
            let transfer = Arc::clone(&self.transfer);
            let halt = self.halt.clone();
            self.track(tokio::spawn(async move { transfer.serve(files, halt).await }))
                .await;
            self.track(tokio::spawn(Arc::clone(self).accept_loop(listener))).await;
        }

        if let Some(port) = self.config.api_port {
            let listener = TcpListener::bind((any, port)).await?;
            log::info!("[:{}] 🌐 HTTP API on {}", self.data_port(), listener.local_addr()?);
            self.track(tokio::spawn(api::serve(Arc::clone(self), listener, self.halt.clone())))
                .await;
        }
        Ok(())
    }

    async fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    /// Stops every loop, waits up to `shutdown_grace`, then forces the rest.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match *state {
                Lifecycle::Starting | Lifecycle::Running => *state = Lifecycle::ShuttingDown,
                other => return Err(ServentError::Lifecycle(format!("{:?}, nothing to shut down", other))),
            }
        }
        let port = self.data_port();
        log::info!("[:{}] 🛑 Shutting down", port);
        self.halt.cancel();

        let grace = self.config.shutdown_grace;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if timeout(grace, futures::future::join_all(tasks)).await.is_err() {
            log::warn!("[:{}] Loops still busy after {:?}, aborting them", port, grace);
            aborts.iter().for_each(|a| a.abort());
        }

        let mut links = std::mem::take(&mut *self.links.lock().await);
        let joined = timeout(grace, async {
            while links.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            log::warn!("[:{}] {} connection task(s) forced down", port, links.len());
            links.shutdown().await;
        }

        // links aborted above never reached their own teardown
        let leftovers: Vec<Arc<ConnectionHandle>> = {
            let mut set = self.connections.lock().await;
            let ids: Vec<ConnectionId> = set.snapshot().iter().map(|c| c.id()).collect();
            ids.into_iter().filter_map(|id| set.remove(id)).collect()
        };
        for conn in leftovers {
            conn.peer().release();
            conn.detach().await;
        }

        if let Err(e) = self.save_cache().await {
            log::warn!("[:{}] Peer cache not saved: {}", port, e);
        }
        *self.state.lock().await = Lifecycle::Stopped;
        log::info!("[:{}] Servent stopped", port);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.halt.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    log::debug!("[:{}] Incoming connection from {}", self.data_port(), remote);
                    let task = connection::accept(Arc::clone(&self), stream, remote);
                    self.spawn_link(task).await;
                }
                Err(e) => log::warn!("[:{}] Accept error: {}", self.data_port(), e),
            }
        }
    }

    async fn spawn_link<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut links = self.links.lock().await;
        // reap finished sessions so the set does not grow with history
        while let Some(Some(_)) = links.join_next().now_or_never() {}
        links.spawn(task);
    }

    // ---- Admission ------------------------------------------------------

    /// Inbound handshake: cache entry resolved, claimed, and admitted in one go.
    pub async fn admit_inbound(
        &self,
        address: IpAddr,
        data_port: u16,
        discovery_port: u16,
    ) -> Result<Arc<ConnectionHandle>> {
        let key = PeerKey::new(address, data_port);
        let mut cache = self.cache.lock().await;
        let (peer, created) = cache.resolve(key, discovery_port);
        if created {
            log::info!("[:{}] 📇 New peer {}", self.data_port(), key);
        }
        if !peer.try_claim() {
            return Err(ServentError::AlreadyConnected(key.to_string()));
        }
        self.register(Arc::clone(&peer)).await.map_err(|e| {
            peer.release();
            e
        })
    }

    /// Adds a link for an already claimed peer; fails at the limit.
    pub async fn register(&self, peer: SharedPeer) -> Result<Arc<ConnectionHandle>> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(
            id,
            peer,
            Arc::clone(&self.queries),
            self.halt.child_token(),
        ));
        self.connections.lock().await.try_admit(Arc::clone(&handle))?;
        Ok(handle)
    }

    pub async fn unregister(&self, id: ConnectionId) {
        self.connections.lock().await.remove(id);
    }

    /// Forgets a peer that stopped answering.
    pub async fn evict(&self, key: &PeerKey) {
        if self.cache.lock().await.remove(key).is_some() {
            log::info!("[:{}] 🗑️  Forgot unreachable peer {}", self.data_port(), key);
        }
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().await.get(id)
    }

    pub async fn connection_to(&self, key: &PeerKey) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().await.find(key)
    }

    pub async fn connections_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.lock().await.snapshot()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn connected_peers(&self) -> Vec<PeerRecord> {
        self.connections_snapshot()
            .await
            .iter()
            .map(|c| c.peer().to_record())
            .collect()
    }

    pub fn shared_files(&self) -> Vec<String> {
        self.transfer.shared_files()
    }

    pub async fn cache_contains(&self, key: &PeerKey) -> bool {
        self.cache.lock().await.contains(key)
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn save_cache(&self) -> Result<()> {
        let Some(path) = &self.config.cache_path else {
            return Ok(());
        };
        let cache = self.cache.lock().await;
        cache.save(path)?;
        log::info!("[:{}] 💾 {} peer(s) saved to {}", self.data_port(), cache.len(), path.display());
        Ok(())
    }

    // ---- Dialing --------------------------------------------------------

    /// Claims `peer` and dials it in the background. False if it was in use.
    pub async fn connect(self: &Arc<Self>, peer: SharedPeer) -> bool {
        if self.is_halting() || !peer.try_claim() {
            return false;
        }
        log::debug!("[:{}] Dialing {}", self.data_port(), peer);
        self.spawn_link(connection::dial(Arc::clone(self), peer)).await;
        true
    }

    /// Manual connect; the discovery port is learned from the handshake.
    pub async fn connect_to(self: &Arc<Self>, address: IpAddr, data_port: u16) -> Result<()> {
        let key = PeerKey::new(address, data_port);
        let peer = {
            let mut cache = self.cache.lock().await;
            let (peer, _) = cache.resolve(key, 0);
            peer
        };
        if !self.connect(peer).await {
            return Err(ServentError::AlreadyConnected(key.to_string()));
        }
        Ok(())
    }

    /// Fills free slots from unused cache entries.
    // Boxed: the dial it spawns comes back here when the link closes.
    pub fn replenish(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            if this.is_halting() {
                return;
            }
            let me = this.self_key();
            let cache = this.cache.lock().await;
            let mut free = this
                .config
                .connections_limit
                .saturating_sub(this.connection_count().await);
            for peer in cache.iter() {
                if free == 0 {
                    break;
                }
                if peer.key() == me || peer.is_in_use() {
                    continue;
                }
                if this.connect(Arc::clone(peer)).await {
                    free -= 1;
                }
            }
        }
        .boxed()
    }

    /// A peer seen in a Pong. Cached if new, dialed if there is room.
    pub async fn discovered(self: &Arc<Self>, key: PeerKey, discovery_port: u16) {
        if key == self.self_key() {
            return;
        }
        let mut cache = self.cache.lock().await;
        let (peer, created) = cache.resolve(key, discovery_port);
        if created {
            log::info!("[:{}] 🧭 Discovered {}", self.data_port(), peer);
        }
        if !peer.is_in_use() && self.connection_count().await < self.config.connections_limit {
            self.connect(peer).await;
        }
    }

    // ---- Directory ------------------------------------------------------

    /// Imports up to 2 x limit reliable peers, then tries to fill the slots.
    pub async fn bootstrap(self: &Arc<Self>, directory: Arc<dyn BootstrapDirectory>) -> Result<usize> {
        let candidates = directory
            .reliable_servents(2 * self.config.connections_limit)
            .await?;
        let me = self.self_key();
        let added = {
            let mut cache = self.cache.lock().await;
            candidates
                .into_iter()
                .filter(|record| record.key() != me)
                .filter(|record| cache.insert(record.clone().into_descriptor()))
                .count()
        };
        log::info!(
            "[:{}] 📚 Bootstrap from {}: {} new peer(s)",
            self.data_port(),
            directory.endpoint(),
            added
        );
        self.remember(directory).await;
        self.replenish().await;
        Ok(added)
    }

    pub async fn subscribe(&self, directory: Arc<dyn BootstrapDirectory>, callback: &str) -> Result<()> {
        directory.subscribe(callback).await?;
        log::info!("[:{}] 🔔 Subscribed to {} at {}", self.data_port(), directory.endpoint(), callback);
        self.remember(directory).await;
        Ok(())
    }

    async fn remember(&self, directory: Arc<dyn BootstrapDirectory>) {
        let mut directories = self.directories.lock().await;
        let endpoint = directory.endpoint();
        if !directories.iter().any(|d| d.endpoint() == endpoint) {
            directories.push(directory);
        }
    }

    pub async fn directory_count(&self) -> usize {
        self.directories.lock().await.len()
    }

    /// Directory notification: a peer just became reliable.
    pub async fn signal_reliable_servent(self: &Arc<Self>, record: PeerRecord) -> bool {
        if record.key() == self.self_key() {
            return false;
        }
        let peer = record.into_descriptor();
        {
            let mut cache = self.cache.lock().await;
            if !cache.insert(Arc::clone(&peer)) {
                return false;
            }
        }
        log::info!("[:{}] ⭐ Reliable servent signalled: {}", self.data_port(), peer);
        if self.connection_count().await < self.config.connections_limit {
            self.connect(peer).await;
        }
        true
    }

    /// Tells every known directory that this node is reliable. Failing ones are pruned.
    pub async fn advertise_reliable(&self) {
        let directories = self.directories.lock().await.clone();
        for directory in directories {
            if let Err(e) = directory.add_reliable(self.data_port()).await {
                let endpoint = directory.endpoint();
                log::warn!("[:{}] Directory {} pruned: {}", self.data_port(), endpoint, e);
                self.directories.lock().await.retain(|d| d.endpoint() != endpoint);
            }
        }
    }

    async fn reliability_loop(self: Arc<Self>) {
        let threshold = self.config.reliable_threshold;
        tokio::select! {
            _ = self.halt.cancelled() => return,
            _ = tokio::time::sleep(threshold) => {}
        }
        log::info!("[:{}] ⭐ Up for {:?}, advertising as reliable", self.data_port(), threshold);
        let refresh = reliable_refresh(threshold);
        loop {
            self.advertise_reliable().await;
            tokio::select! {
                _ = self.halt.cancelled() => break,
                _ = tokio::time::sleep(refresh) => {}
            }
        }
    }

    // ---- Search & download ----------------------------------------------

    /// Floods a Query for the whitespace-separated keywords of `text`.
    pub async fn search(&self, text: &str) -> Arc<SearchSession> {
        let keywords: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        let query = Message::query(keywords.clone());
        let session = Arc::new(SearchSession::new(query.id, keywords));
        self.searches
            .lock()
            .await
            .insert(query.id, Arc::clone(&session));
        self.record_seen(query.id, Route::Local).await;

        let links = self.connections_snapshot().await;
        for conn in &links {
            conn.forward(query.clone(), Route::Peer(conn.id())).await;
        }
        log::info!(
            "[:{}] 🔍 Search {} for {:?} sent to {} peer(s)",
            self.data_port(),
            query.id,
            session.keywords(),
            links.len()
        );
        session
    }

    /// Late hits for a stopped search are dropped.
    pub async fn stop_search(&self, session: &SearchSession) {
        self.queries.remove(&session.id()).await;
        self.searches.lock().await.remove(&session.id());
    }

    pub async fn session(&self, id: &MessageId) -> Option<Arc<SearchSession>> {
        self.searches.lock().await.get(id).cloned()
    }

    pub async fn download(&self, result: &SearchResult) -> Result<DownloadOutcome> {
        if !result.firewalled {
            let bytes = self.transfer.fetch(result.source(), &result.file_name).await?;
            return Ok(DownloadOutcome::Fetched(bytes));
        }

        let no_route = || ServentError::NoPushRoute(result.search_id.to_string());
        let Some(Route::Peer(id)) = self.push_routes.destination(&result.search_id).await else {
            return Err(no_route());
        };
        let conn = self.connection(id).await.ok_or_else(no_route)?;
        let push = Message::push(result.search_id, &result.file_name, self.transfer_port());
        conn.forward(push, Route::Peer(id)).await;
        log::info!(
            "[:{}] 📨 Push for \"{}\" sent via {}",
            self.data_port(),
            result.file_name,
            conn.peer()
        );
        Ok(DownloadOutcome::PushRequested(id))
    }

    /// Firewalled holder side of a Push: open the socket ourselves.
    pub async fn serve_push(&self, push: Push) {
        let Some(address) = push.target else {
            log::warn!("Push for \"{}\" has no target address", push.file_name);
            return;
        };
        let target = SocketAddr::new(address, push.transfer_port);
        let transfer = Arc::clone(&self.transfer);
        // joined or aborted by shutdown like the links
        self.spawn_link(async move {
            if let Err(e) = transfer.push(&push.file_name, target).await {
                log::warn!("Push of \"{}\" to {} failed: {}", push.file_name, target, e);
            }
        })
        .await;
    }

    // ---- Status ---------------------------------------------------------

    pub async fn status(&self) -> ServentStatus {
        let cached_peers = self.cache_len().await;
        ServentStatus {
            state: self.state().await,
            address: self.config.public_address,
            data_port: self.data_port(),
            discovery_port: self.discovery_port(),
            transfer_port: self.transfer_port(),
            firewalled: self.is_firewalled(),
            connections: self.connection_count().await,
            connections_limit: self.config.connections_limit,
            cached_peers,
            searches: self.searches.lock().await.len(),
            directories: self.directory_count().await,
            uptime_secs: self.started_at.get().map(|t| t.elapsed().as_secs()).unwrap_or(0),
        }
    }
}

#[async_trait]
impl Router for Servent {
    fn routes(&self) -> &RoutingTable {
        &self.queries
    }

    fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Flood: every active link except `origin`.
    async fn send(&self, message: Message, origin: Route) {
        for conn in self.connections_snapshot().await {
            let route = Route::Peer(conn.id());
            if route != origin {
                conn.forward(message.clone(), route).await;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServentStatus {
    pub state: Lifecycle,
    pub address: IpAddr,
    pub data_port: u16,
    pub discovery_port: u16,
    pub transfer_port: u16,
    pub firewalled: bool,
    pub connections: usize,
    pub connections_limit: usize,
    pub cached_peers: usize,
    pub searches: usize,
    pub directories: usize,
    pub uptime_secs: u64,
}

impl std::fmt::Display for ServentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "═══════════════════════════════════════\n\
             SERVENT STATUS\n\
             ═══════════════════════════════════════\n\
             State:    {:?}{}\n\
             Addr:     {}:{} (discovery {}, files {})\n\
             Links:    {}/{}\n\
             Cache:    {} peers\n\
             Searches: {} running\n\
             Dirs:     {}\n\
             Uptime:   {}s\n\
             ═══════════════════════════════════════",
            self.state,
            if self.firewalled { " (firewalled)" } else { "" },
            self.address,
            self.data_port,
            self.discovery_port,
            self.transfer_port,
            self.connections,
            self.connections_limit,
            self.cached_peers,
            self.searches,
            self.directories,
            self.uptime_secs
        )
    }
}
