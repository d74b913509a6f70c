//! Protocol constants for Servent Core
//!
//! Markers, default ports and timings shared by every part of the node.

use std::time::Duration;

/// Network name shown in the banner
pub const NETWORK_NAME: &str = "Servent Overlay";

/// Node version
pub const VERSION: &str = "0.1.0-alpha";

/// Project tagline
pub const TAGLINE: &str = "Flood search, reverse routes, pushes through firewalls";

// ═══════════════════════════════════════════════════════════════
// Handshake markers
// ═══════════════════════════════════════════════════════════════

/// Connection request: `CONNECT <dataPort>,<discoveryPort>`
pub const CONNECT_MARKER: &str = "CONNECT";

/// Positive reply: `ACCEPTED <discoveryPort>`
pub const ACCEPT_MARKER: &str = "ACCEPTED";

/// Negative reply, sent alone
pub const REFUSE_MARKER: &str = "REFUSED";

// ═══════════════════════════════════════════════════════════════
// File transfer markers
// ═══════════════════════════════════════════════════════════════

pub const GET_MARKER: &str = "GET";
pub const PUSH_MARKER: &str = "PUSH";
pub const FOUND_MARKER: &str = "FOUND";
pub const NOT_FOUND_MARKER: &str = "NOT FOUND";

// ═══════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════

/// Hop budget of a freshly created message
pub const DEFAULT_TTL: u8 = 7;

/// Random bytes hashed into a message identity
pub const ID_SEED_LENGTH: usize = 16;

/// Largest discovery datagram
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Largest TCP frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Largest request line of the file transfer protocol
pub const MAX_REQUEST_LINE: usize = 4 * 1024;

// ═══════════════════════════════════════════════════════════════
// Ports and limits
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_DATA_PORT: u16 = 6346;
pub const DEFAULT_DISCOVERY_PORT: u16 = 6347;
pub const DEFAULT_TRANSFER_PORT: u16 = 6348;
pub const DEFAULT_CONNECTIONS_LIMIT: usize = 4;

// ═══════════════════════════════════════════════════════════════
// Timings
// ═══════════════════════════════════════════════════════════════

pub const PING_INTERVAL: Duration = Duration::from_secs(10);
pub const SENDER_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const RELIABLE_THRESHOLD: Duration = Duration::from_secs(30);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reliability is re-advertised at this fraction of the threshold
pub const RELIABLE_REFRESH_RATIO: f64 = 0.6;

/// Timeout of a single directory HTTP call
pub const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(4);

// ═══════════════════════════════════════════════════════════════
// Display functions
// ═══════════════════════════════════════════════════════════════

/// Print the startup banner
pub fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                   SERVENT CORE NODE                       ║");
    println!("║                                                            ║");
    println!("║  Ping • Pong • Query • QueryHit • Push                    ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  {} v{}", NETWORK_NAME, VERSION);
    println!("  {}", TAGLINE);
    println!();
}

/// Interval between two reliability advertisements
pub fn reliable_refresh(threshold: Duration) -> Duration {
    threshold.mul_f64(RELIABLE_REFRESH_RATIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_distinct() {
        assert_ne!(ACCEPT_MARKER, REFUSE_MARKER);
        assert!(!ACCEPT_MARKER.starts_with(CONNECT_MARKER));
        assert!(NOT_FOUND_MARKER != FOUND_MARKER);
    }

    #[test]
    fn test_reliable_refresh() {
        assert_eq!(reliable_refresh(Duration::from_secs(30)), Duration::from_secs(18));
    }
}
