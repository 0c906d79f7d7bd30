//! Session events and statistics
//!
//! The session reports its lifecycle as typed events over a channel
//! instead of delegate callbacks, so owners can consume them from any
//! task and tests can assert on their exact order.

use std::time::Duration;

use ovpn_protocol::PushReply;

/// Externally visible session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Waiting for the server to answer the hard reset
    Connecting,
    /// TLS and credential negotiation in progress
    Handshaking,
    /// Tunnel established, data flowing
    Connected,
    /// Stop requested, final events pending
    Disconnecting,
    /// Session is over
    Disconnected,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }

    pub fn description(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "Connecting...",
            SessionStatus::Handshaking => "Handshaking...",
            SessionStatus::Connected => "Connected",
            SessionStatus::Disconnecting => "Disconnecting...",
            SessionStatus::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Tunnel traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes received through the tunnel
    pub bytes_rx: u64,
    /// Bytes transmitted through the tunnel
    pub bytes_tx: u64,
    /// Packets received
    pub packets_rx: u64,
    /// Packets transmitted
    pub packets_tx: u64,
    /// Time connected
    pub uptime: Duration,
}

impl SessionStats {
    pub fn record_rx(&mut self, bytes: usize) {
        self.bytes_rx += bytes as u64;
        self.packets_rx += 1;
    }

    pub fn record_tx(&mut self, bytes: usize) {
        self.bytes_tx += bytes as u64;
        self.packets_tx += 1;
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_rx + self.bytes_tx
    }
}

/// Events emitted by the session engine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Status changed
    StatusChanged {
        old: SessionStatus,
        new: SessionStatus,
    },

    /// Tunnel negotiated and usable
    Started {
        /// Remote address the session is bound to
        remote: String,
        /// The server's pushed settings
        reply: PushReply,
    },

    /// A soft renegotiation completed and rotated the data keys
    Renegotiated {
        /// Key id of the new current key
        key_id: u8,
    },

    /// Session stopped
    Stopped {
        /// Whether the owner should re-establish the session
        reconnect: bool,
        /// Human-readable reason
        reason: String,
    },

    /// Periodic traffic counters
    DataCount(SessionStats),
}
