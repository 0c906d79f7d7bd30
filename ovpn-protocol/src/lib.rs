//! OpenVPN Protocol Implementation
//!
//! Client-side wire machinery for the OpenVPN 2.3+ protocol: control/data
//! packet codec, the reliable ack'd control channel, TLS-wrap modes,
//! TLS1-PRF key derivation and the per-key encrypted data path.

mod auth;
mod crypto;
mod data;
mod error;
mod packet;
mod prf;
mod push;
mod reliable;
mod replay;
mod secure;
mod session;
pub mod transport;
mod wrap;

pub use auth::Authenticator;
pub use crypto::{pem_md5, random_bytes, Cipher, Digest};
pub use data::{CompressionFraming, DataPath};
pub use error::{Error, Result};
pub use packet::{
    opcode_byte, parse_opcode_byte, ControlPacket, DataHeader, PacketCode, MAX_ACKS_PER_PACKET,
    PACKET_ID_LEN, PEER_ID_DISABLED, SESSION_ID_LEN,
};
pub use prf::{derive_data_channel_keys, tls1_prf, DataChannelKeys, KeySource, ServerKeySource};
pub use push::{PushReply, Route};
pub use reliable::{ControlChannel, RETRANSMISSION_INTERVAL};
pub use replay::ReplayWindow;
pub use secure::SecureBytes;
pub use session::SessionId;
pub use wrap::{StaticKey, TlsWrap, WrapStrategy};

/// Number of concurrent key slots addressable by the 3-bit key id
pub const NUMBER_OF_KEYS: u8 = 8;

/// The data-channel keepalive payload. A decrypted data packet carrying
/// exactly these bytes is a ping, not tunnel traffic.
pub const DATA_CHANNEL_PING: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
    0x48,
];

/// Default MTU assumed when the link does not report one
pub const DEFAULT_MTU: usize = 1500;
