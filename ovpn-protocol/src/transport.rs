//! Abstract link and tunnel transports
//!
//! The session engine consumes two narrow capability traits: a
//! [`LinkTransport`] carrying encrypted OpenVPN packets to the server and a
//! [`TunTransport`] exchanging plaintext IP packets with the local tunnel
//! interface. Both are async and implemented once per real transport
//! (UDP, TCP, platform tun) plus the in-memory mocks used by tests.

pub mod mock;

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::Result;

/// Transport for the network link carrying OpenVPN packets
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Address of the remote peer
    fn remote_address(&self) -> SocketAddr;

    /// Link MTU for outbound packets
    fn mtu(&self) -> usize;

    /// Whether the link itself guarantees delivery and ordering (TCP).
    ///
    /// Reliable links disable control-channel retransmission timers and
    /// change push-request retry gating.
    fn is_reliable(&self) -> bool;

    /// How many packets a single read may return at most
    fn packet_buffer_size(&self) -> usize {
        64
    }

    /// Receive a batch of packets, in arrival order.
    ///
    /// Blocks until at least one packet is available or the link fails.
    async fn recv(&self) -> Result<Vec<Vec<u8>>>;

    /// Send a batch of packets, in order
    async fn send(&self, packets: &[Vec<u8>]) -> Result<()>;
}

/// Transport for the local tunnel interface
#[async_trait]
pub trait TunTransport: Send + Sync {
    /// Whether the interface outlives the session (persistent tun)
    fn is_persistent(&self) -> bool;

    /// Receive a batch of outbound IP packets from the OS
    async fn recv(&self) -> Result<Vec<Vec<u8>>>;

    /// Deliver a batch of decrypted IP packets to the OS, preserving order
    async fn send(&self, packets: &[Vec<u8>]) -> Result<()>;
}
