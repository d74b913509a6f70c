//! Servent Core: a node of a flood-search file discovery overlay.
//!
//! Every node is client and server at once. It keeps a bounded set of TCP
//! links, discovers peers over UDP, floods keyword queries with a hop budget
//! and routes hits and pushes back along the path the query came from.

pub mod api;
pub mod config;
pub mod connection;
pub mod constants;
pub mod directory;
pub mod error;
pub mod explorer;
pub mod message;
pub mod peer;
pub mod router;
pub mod search;
pub mod servent;
pub mod transfer;

#[cfg(test)]
mod testing;
