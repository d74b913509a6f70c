// =============================================================================
// SERVENT CORE - peer.rs
// Peer descriptors and the persistent peer cache
// =============================================================================
//
// A descriptor is identified by address + data port only. The discovery port
// may be unknown when a peer is first seen (manual connect, directory entry)
// and is learned later, so it never takes part in identity.
//
// Descriptors are shared (Arc) between the cache and the connection that uses
// them: flipping `in_use` or learning the discovery port is visible to both.
// =============================================================================

use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};
use std::sync::Arc;

// -----------------------------------------------------------------------------
// PeerKey
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey {
    pub address: IpAddr,
    pub data_port: u16,
}

impl PeerKey {
    pub fn new(address: IpAddr, data_port: u16) -> Self {
        PeerKey { address, data_port }
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.data_port)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data_addr())
    }
}

// -----------------------------------------------------------------------------
// PeerDescriptor
// -----------------------------------------------------------------------------

pub type SharedPeer = Arc<PeerDescriptor>;

#[derive(Debug)]
pub struct PeerDescriptor {
    key: PeerKey,
    discovery_port: AtomicU16,
    in_use: AtomicBool,
    last_seen_ms: AtomicI64,
}

impl PeerDescriptor {
    pub fn new(address: IpAddr, data_port: u16, discovery_port: u16) -> Self {
        PeerDescriptor {
            key: PeerKey::new(address, data_port),
            discovery_port: AtomicU16::new(discovery_port),
            in_use: AtomicBool::new(false),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn shared(address: IpAddr, data_port: u16, discovery_port: u16) -> SharedPeer {
        Arc::new(Self::new(address, data_port, discovery_port))
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn address(&self) -> IpAddr {
        self.key.address
    }

    pub fn data_port(&self) -> u16 {
        self.key.data_port
    }

    /// 0 while unknown.
    pub fn discovery_port(&self) -> u16 {
        self.discovery_port.load(Ordering::Acquire)
    }

    pub fn set_discovery_port(&self, port: u16) {
        self.discovery_port.store(port, Ordering::Release);
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        match self.discovery_port() {
            0 => None,
            port => Some(SocketAddr::new(self.key.address, port)),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Marks the descriptor in use. Fails if someone else already holds it.
    pub fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_seen_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn to_record(&self) -> PeerRecord {
        PeerRecord {
            address: self.address(),
            data_port: self.data_port(),
            discovery_port: self.discovery_port(),
            last_seen: self.last_seen(),
        }
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

// -----------------------------------------------------------------------------
// PeerRecord - what goes on disk and over the directory API
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub data_port: u16,
    #[serde(default)]
    pub discovery_port: u16,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn key(&self) -> PeerKey {
        PeerKey::new(self.address, self.data_port)
    }

    /// A live descriptor, never in use.
    pub fn into_descriptor(self) -> SharedPeer {
        let descriptor = PeerDescriptor::new(self.address, self.data_port, self.discovery_port);
        descriptor
            .last_seen_ms
            .store(self.last_seen.timestamp_millis(), Ordering::Release);
        Arc::new(descriptor)
    }
}

// -----------------------------------------------------------------------------
// PeerCache
// -----------------------------------------------------------------------------

/// Ordered, duplicate-free collection of known peers.
///
/// Not synchronised on its own: the servent wraps it in one mutex so that
/// contains-then-add and scan-then-remove sequences stay atomic.
#[derive(Debug, Default)]
pub struct PeerCache {
    entries: Vec<SharedPeer>,
}

impl PeerCache {
    pub fn new() -> Self {
        PeerCache { entries: Vec::new() }
    }

    pub fn from_records(records: Vec<PeerRecord>) -> Self {
        let mut cache = PeerCache::new();
        for record in records {
            cache.insert(record.into_descriptor());
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.entries.iter().any(|p| p.key() == *key)
    }

    pub fn get(&self, key: &PeerKey) -> Option<SharedPeer> {
        self.entries.iter().find(|p| p.key() == *key).cloned()
    }

    /// Adds the descriptor unless an equal one is already present.
    pub fn insert(&mut self, peer: SharedPeer) -> bool {
        if self.contains(&peer.key()) {
            return false;
        }
        self.entries.push(peer);
        true
    }

    /// Returns the cached entry for `key`, creating it when missing.
    /// A known discovery port (non-zero) refreshes the cached one.
    pub fn resolve(&mut self, key: PeerKey, discovery_port: u16) -> (SharedPeer, bool) {
        if let Some(existing) = self.get(&key) {
            if discovery_port != 0 {
                existing.set_discovery_port(discovery_port);
            }
            existing.touch();
            return (existing, false);
        }
        let peer = PeerDescriptor::shared(key.address, key.data_port, discovery_port);
        self.entries.push(Arc::clone(&peer));
        (peer, true)
    }

    pub fn remove(&mut self, key: &PeerKey) -> Option<SharedPeer> {
        let index = self.entries.iter().position(|p| p.key() == *key)?;
        Some(self.entries.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedPeer> {
        self.entries.iter()
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        self.entries.iter().map(|p| p.to_record()).collect()
    }

    /// Loads a cache file. In-use state is never persisted, so every entry
    /// comes back free.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<PeerRecord> = serde_json::from_str(&raw)?;
        Ok(Self::from_records(records))
    }

    /// Missing file means an empty cache; a corrupt one is reported.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(PeerCache::new());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.records())?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_identity_ignores_discovery_port() {
        let a = PeerDescriptor::new(ip("10.0.0.2"), 6000, 6001);
        let b = PeerDescriptor::new(ip("10.0.0.2"), 6000, 9999);
        let c = PeerDescriptor::new(ip("10.0.0.2"), 6002, 6001);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a.key());
        assert!(set.contains(&b.key()));
        assert!(!set.contains(&c.key()));
    }

    #[test]
    fn test_claim_and_release() {
        let p = PeerDescriptor::new(ip("10.0.0.3"), 6000, 0);
        assert!(p.try_claim());
        assert!(!p.try_claim());
        assert!(p.is_in_use());
        p.release();
        assert!(p.try_claim());
    }

    #[test]
    fn test_cache_unique_and_resolve_learns_port() {
        let mut cache = PeerCache::new();
        assert!(cache.insert(PeerDescriptor::shared(ip("10.0.0.2"), 6000, 0)));
        assert!(!cache.insert(PeerDescriptor::shared(ip("10.0.0.2"), 6000, 6001)));
        assert_eq!(cache.len(), 1);

        let (peer, created) = cache.resolve(PeerKey::new(ip("10.0.0.2"), 6000), 6001);
        assert!(!created);
        assert_eq!(peer.discovery_port(), 6001);
        assert_eq!(cache.get(&peer.key()).unwrap().discovery_port(), 6001);

        let (_, created) = cache.resolve(PeerKey::new(ip("10.0.0.4"), 6000), 0);
        assert!(created);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_shared_descriptor_sees_in_use() {
        let mut cache = PeerCache::new();
        let (peer, _) = cache.resolve(PeerKey::new(ip("10.0.0.2"), 6000), 6001);
        assert!(peer.try_claim());
        assert!(cache.get(&peer.key()).unwrap().is_in_use());
    }

    #[test]
    fn test_remove() {
        let mut cache = PeerCache::new();
        let key = PeerKey::new(ip("10.0.0.9"), 1);
        cache.resolve(key, 2);
        assert!(cache.remove(&key).is_some());
        assert!(cache.remove(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_load_clears_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let mut cache = PeerCache::new();
        let (a, _) = cache.resolve(PeerKey::new(ip("10.0.0.2"), 6000), 6001);
        cache.resolve(PeerKey::new(ip("10.0.0.3"), 6000), 0);
        assert!(a.try_claim());
        cache.save(&path).unwrap();

        let loaded = PeerCache::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|p| !p.is_in_use()));
        assert_eq!(loaded.get(&a.key()).unwrap().discovery_port(), 6001);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PeerCache::load_or_default(&dir.path().join("none.json")).unwrap();
        assert!(cache.is_empty());
    }
}
