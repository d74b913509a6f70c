// =============================================================================
// SERVENT CORE - message.rs
// Overlay message model
// =============================================================================
//
// Five message kinds travel through the overlay:
//   Ping / Pong      - UDP topology discovery
//   Query / QueryHit - flood search and reverse-routed answers
//   Push             - asks a firewalled holder to open the transfer itself
//
// A reply (Pong, QueryHit, Push) reuses the identity of the message it
// answers, which is what lets every hop find the reverse route.
// =============================================================================

use crate::constants::{DEFAULT_TTL, ID_SEED_LENGTH};
use crate::error::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;

// -----------------------------------------------------------------------------
// MessageId
// -----------------------------------------------------------------------------

/// 256-bit identity: SHA-256 over random bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub fn random() -> Self {
        let mut seed = [0u8; ID_SEED_LENGTH];
        rand::thread_rng().fill_bytes(&mut seed);
        MessageId(Sha256::digest(seed).into())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

// -----------------------------------------------------------------------------
// Payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub data_port: u16,
    pub discovery_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub data_port: u16,
    pub discovery_port: u16,
    /// Unknown to a node behind a firewall; filled at the first hop.
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub matches: Vec<String>,
    pub transfer_port: u16,
    pub firewalled: bool,
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub file_name: String,
    /// Transfer port of the requester, where the file must be pushed.
    pub transfer_port: u16,
    /// Requester address, filled by the first hop.
    pub target: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Ping(Ping),
    Pong(Pong),
    Query(Query),
    QueryHit(QueryHit),
    Push(Push),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Query,
    QueryHit,
    Push,
}

// -----------------------------------------------------------------------------
// Message
// -----------------------------------------------------------------------------

/// Result of preparing a message for one more hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Hop budget consumed; carries what is left.
    Alive(u8),
    /// Nothing left, the message must not be relayed.
    Dead,
}

impl Forward {
    pub fn is_alive(self) -> bool {
        matches!(self, Forward::Alive(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub ttl: u8,
    pub payload: Payload,
}

impl Message {
    fn fresh(payload: Payload) -> Self {
        Message { id: MessageId::random(), ttl: DEFAULT_TTL, payload }
    }

    fn reply(id: MessageId, payload: Payload) -> Self {
        Message { id, ttl: DEFAULT_TTL, payload }
    }

    pub fn ping(data_port: u16, discovery_port: u16) -> Self {
        Self::fresh(Payload::Ping(Ping { data_port, discovery_port }))
    }

    pub fn pong(ping_id: MessageId, data_port: u16, discovery_port: u16) -> Self {
        Self::reply(
            ping_id,
            Payload::Pong(Pong { data_port, discovery_port, address: None }),
        )
    }

    pub fn query(keywords: Vec<String>) -> Self {
        Self::fresh(Payload::Query(Query { keywords }))
    }

    pub fn query_hit(query_id: MessageId, matches: Vec<String>, transfer_port: u16, firewalled: bool) -> Self {
        Self::reply(
            query_id,
            Payload::QueryHit(QueryHit { matches, transfer_port, firewalled, address: None }),
        )
    }

    pub fn push(hit_id: MessageId, file_name: &str, transfer_port: u16) -> Self {
        Self::reply(
            hit_id,
            Payload::Push(Push { file_name: file_name.to_string(), transfer_port, target: None }),
        )
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Ping(_) => MessageKind::Ping,
            Payload::Pong(_) => MessageKind::Pong,
            Payload::Query(_) => MessageKind::Query,
            Payload::QueryHit(_) => MessageKind::QueryHit,
            Payload::Push(_) => MessageKind::Push,
        }
    }

    /// Spends one hop. A message already at zero is dead and stays at zero.
    pub fn prepare_forward(&mut self) -> Forward {
        if self.ttl == 0 {
            return Forward::Dead;
        }
        self.ttl -= 1;
        Forward::Alive(self.ttl)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{} ttl={}", self.kind(), self.id, self.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_DATAGRAM_SIZE;

    #[test]
    fn test_eighth_forward_is_dead() {
        let mut msg = Message::query(vec!["foo".into()]);
        for expected in (0..DEFAULT_TTL).rev() {
            assert_eq!(msg.prepare_forward(), Forward::Alive(expected));
        }
        assert_eq!(msg.prepare_forward(), Forward::Dead);
        assert_eq!(msg.ttl, 0);
        assert!(!msg.prepare_forward().is_alive());
    }

    #[test]
    fn test_replies_share_identity() {
        let ping = Message::ping(6346, 6347);
        let pong = Message::pong(ping.id, 7000, 7001);
        assert_eq!(ping.id, pong.id);
        assert_eq!(pong.kind(), MessageKind::Pong);

        let query = Message::query(vec!["a".into()]);
        let hit = Message::query_hit(query.id, vec!["a.txt".into()], 6348, true);
        assert_eq!(query.id, hit.id);
        assert_eq!(Message::push(hit.id, "a.txt", 1).id, query.id);
    }

    #[test]
    fn test_fresh_identities_differ() {
        let a = Message::ping(1, 2);
        let b = Message::ping(1, 2);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_codec_keeps_ttl_and_address() {
        let mut hit = Message::query_hit(MessageId::random(), vec!["foo.txt".into()], 6348, false);
        hit.prepare_forward();
        if let Payload::QueryHit(h) = &mut hit.payload {
            h.address = Some("10.0.0.2".parse().unwrap());
        }
        let decoded = Message::decode(&hit.encode().unwrap()).unwrap();
        assert_eq!(decoded, hit);
        assert_eq!(decoded.ttl, DEFAULT_TTL - 1);
    }

    #[test]
    fn test_discovery_messages_fit_datagram() {
        let mut pong = Message::pong(MessageId::random(), 65535, 65535);
        if let Payload::Pong(p) = &mut pong.payload {
            p.address = Some("2001:db8::1".parse().unwrap());
        }
        assert!(pong.encode().unwrap().len() <= MAX_DATAGRAM_SIZE);
        assert!(Message::ping(1, 2).encode().unwrap().len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(Message::decode(&[0xff, 0x01, 0x02]).is_err());
    }
}
