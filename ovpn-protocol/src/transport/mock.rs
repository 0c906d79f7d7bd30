//! In-memory transport mocks for testing
//!
//! [`MockLink`] and [`MockTun`] simulate the two session-facing transports
//! with packet injection and capture, so protocol flows can be exercised
//! without sockets or tun devices.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::{LinkTransport, TunTransport};
use crate::error::{Error, Result};

/// Mock network link with inject/capture hooks
pub struct MockLink {
    remote: SocketAddr,
    mtu: usize,
    reliable: bool,
    inbound_tx: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<Vec<u8>>>>,
    sent: StdMutex<Vec<Vec<u8>>>,
    fail_writes: StdMutex<bool>,
}

impl MockLink {
    /// Create an unreliable (UDP-like) mock link
    pub fn new(remote: SocketAddr, mtu: usize) -> Self {
        Self::with_reliability(remote, mtu, false)
    }

    /// Create a mock link with explicit reliability semantics
    pub fn with_reliability(remote: SocketAddr, mtu: usize, reliable: bool) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            remote,
            mtu,
            reliable,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            sent: StdMutex::new(Vec::new()),
            fail_writes: StdMutex::new(false),
        }
    }

    /// Queue packets to be returned by the next `recv`
    pub fn inject(&self, packets: Vec<Vec<u8>>) {
        let _ = self.inbound_tx.send(packets);
    }

    /// Everything the session has written so far, in order
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("mock lock poisoned").clone()
    }

    /// Drop and return captured outbound packets
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().expect("mock lock poisoned"))
    }

    /// Make subsequent writes fail (simulated link loss)
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().expect("mock lock poisoned") = fail;
    }
}

#[async_trait]
impl LinkTransport for MockLink {
    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }

    async fn recv(&self) -> Result<Vec<Vec<u8>>> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Transport("mock link closed".to_string()))
    }

    async fn send(&self, packets: &[Vec<u8>]) -> Result<()> {
        if *self.fail_writes.lock().expect("mock lock poisoned") {
            return Err(Error::Transport("mock link write failure".to_string()));
        }
        self.sent
            .lock()
            .expect("mock lock poisoned")
            .extend_from_slice(packets);
        Ok(())
    }
}

/// Mock tunnel interface with inject/capture hooks
pub struct MockTun {
    persistent: bool,
    inbound_tx: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<Vec<u8>>>>,
    written: StdMutex<Vec<Vec<u8>>>,
}

impl MockTun {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            persistent: false,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            written: StdMutex::new(Vec::new()),
        }
    }

    /// Queue IP packets as if the OS had routed them into the tunnel
    pub fn inject(&self, packets: Vec<Vec<u8>>) {
        let _ = self.inbound_tx.send(packets);
    }

    /// Decrypted packets delivered to the OS so far, in order
    pub fn written_packets(&self) -> Vec<Vec<u8>> {
        self.written.lock().expect("mock lock poisoned").clone()
    }
}

impl Default for MockTun {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunTransport for MockTun {
    fn is_persistent(&self) -> bool {
        self.persistent
    }

    async fn recv(&self) -> Result<Vec<Vec<u8>>> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Transport("mock tun closed".to_string()))
    }

    async fn send(&self, packets: &[Vec<u8>]) -> Result<()> {
        self.written
            .lock()
            .expect("mock lock poisoned")
            .extend_from_slice(packets);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.5:1194".parse().unwrap()
    }

    #[tokio::test]
    async fn test_mock_link_inject_and_capture() {
        let link = MockLink::new(addr(), 1400);
        assert_eq!(link.mtu(), 1400);
        assert!(!link.is_reliable());
        assert_eq!(link.remote_address(), addr());

        link.inject(vec![vec![1, 2], vec![3]]);
        let packets = link.recv().await.unwrap();
        assert_eq!(packets, vec![vec![1, 2], vec![3]]);

        link.send(&[vec![9, 9]]).await.unwrap();
        assert_eq!(link.sent_packets(), vec![vec![9, 9]]);
        assert_eq!(link.take_sent(), vec![vec![9, 9]]);
        assert!(link.sent_packets().is_empty());
    }

    #[tokio::test]
    async fn test_mock_link_write_failure() {
        let link = MockLink::new(addr(), 1400);
        link.set_fail_writes(true);
        assert!(link.send(&[vec![1]]).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_tun_flow() {
        let tun = MockTun::new();
        tun.inject(vec![vec![0x45, 0x00]]);
        assert_eq!(tun.recv().await.unwrap(), vec![vec![0x45, 0x00]]);

        tun.send(&[vec![0x45, 0x01], vec![0x45, 0x02]]).await.unwrap();
        assert_eq!(
            tun.written_packets(),
            vec![vec![0x45, 0x01], vec![0x45, 0x02]]
        );
    }
}
