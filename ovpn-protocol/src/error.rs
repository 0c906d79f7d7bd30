//! Error types for the OpenVPN protocol layer

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or transforming packets
#[derive(Debug, Error)]
pub enum Error {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("unknown packet opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("invalid packet data")]
    InvalidPacket,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("replayed data packet id {0}")]
    ReplayedPacket(u32),

    #[error("peer id mismatch: expected {expected:#08x}, got {actual:#08x}")]
    PeerIdMismatch { expected: u32, actual: u32 },

    #[error("control packet failed replay protection")]
    ControlReplay,

    #[error("control data prefix mismatch")]
    WrongControlDataPrefix,

    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
