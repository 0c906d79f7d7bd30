//! Concrete link transports
//!
//! [`UdpLink`] carries one OpenVPN packet per datagram. [`TcpLink`] uses
//! the OpenVPN stream framing (2-byte big-endian length prefix per packet)
//! and reports itself reliable, which disables control-channel
//! retransmission.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

use ovpn_protocol::transport::LinkTransport;
use ovpn_protocol::{Error, Result, DEFAULT_MTU};

/// Largest packet accepted from either transport
const MAX_PACKET_SIZE: usize = 64 * 1024;

/// UDP link: unreliable, one packet per datagram
pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    mtu: usize,
}

impl UdpLink {
    /// Bind an ephemeral local port and connect it to `remote`
    pub async fn connect(remote: SocketAddr, mtu: usize) -> Result<Self> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid literal")
        } else {
            "[::]:0".parse().expect("valid literal")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        Ok(Self {
            socket,
            remote,
            mtu: if mtu == 0 { DEFAULT_MTU } else { mtu },
        })
    }
}

#[async_trait]
impl LinkTransport for UdpLink {
    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_reliable(&self) -> bool {
        false
    }

    async fn recv(&self) -> Result<Vec<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(vec![buf])
    }

    async fn send(&self, packets: &[Vec<u8>]) -> Result<()> {
        for packet in packets {
            self.socket.send(packet).await?;
        }
        Ok(())
    }
}

/// TCP link: reliable, length-prefixed stream framing
pub struct TcpLink {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    remote: SocketAddr,
    mtu: usize,
}

impl TcpLink {
    /// Connect to `remote`
    pub async fn connect(remote: SocketAddr, mtu: usize) -> Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote,
            mtu: if mtu == 0 { DEFAULT_MTU } else { mtu },
        })
    }
}

#[async_trait]
impl LinkTransport for TcpLink {
    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_reliable(&self) -> bool {
        true
    }

    async fn recv(&self) -> Result<Vec<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut length = [0u8; 2];
        reader.read_exact(&mut length).await?;
        let length = u16::from_be_bytes(length) as usize;
        if length > MAX_PACKET_SIZE {
            return Err(Error::Transport(format!(
                "oversized stream packet ({} bytes)",
                length
            )));
        }
        let mut packet = vec![0u8; length];
        reader.read_exact(&mut packet).await?;
        Ok(vec![packet])
    }

    async fn send(&self, packets: &[Vec<u8>]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        for packet in packets {
            if packet.len() > u16::MAX as usize {
                return Err(Error::Transport(format!(
                    "packet too large for stream framing ({} bytes)",
                    packet.len()
                )));
            }
            writer.write_all(&(packet.len() as u16).to_be_bytes()).await?;
            writer.write_all(packet).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}
