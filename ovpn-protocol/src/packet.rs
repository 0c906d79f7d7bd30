//! Control and data packet codec
//!
//! First byte of every packet:
//!
//! ```text
//! +-----------------+
//! | code:5 | keyid:3 |
//! +-----------------+
//! ```
//!
//! Control packets continue with:
//!
//! ```text
//! session id (8)
//! ack_len (1)
//! ack_ids (ack_len x 4)
//! ack remote session id (8, iff ack_len > 0)
//! packet id (4, non-ack only)
//! payload (non-ack only)
//! ```
//!
//! Data V1 carries ciphertext directly after the first byte; data V2
//! inserts a 3-byte peer id in between.

use crate::session::SessionId;
use crate::{Error, Result};

/// Length of a session identifier on the wire
pub const SESSION_ID_LEN: usize = 8;

/// Length of a control packet id on the wire
pub const PACKET_ID_LEN: usize = 4;

/// Maximum number of acks piggybacked on a single control packet
pub const MAX_ACKS_PER_PACKET: usize = 255;

/// Sentinel stamped into data V2 frames when the server pushed no peer id
pub const PEER_ID_DISABLED: u32 = 0xFF_FF_FF;

/// Packet opcodes (5-bit wire values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketCode {
    SoftResetV1 = 0x03,
    ControlV1 = 0x04,
    AckV1 = 0x05,
    DataV1 = 0x06,
    HardResetClientV2 = 0x07,
    HardResetServerV2 = 0x08,
    DataV2 = 0x09,
}

impl PacketCode {
    /// Parse a 5-bit opcode value
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            0x03 => Ok(PacketCode::SoftResetV1),
            0x04 => Ok(PacketCode::ControlV1),
            0x05 => Ok(PacketCode::AckV1),
            0x06 => Ok(PacketCode::DataV1),
            0x07 => Ok(PacketCode::HardResetClientV2),
            0x08 => Ok(PacketCode::HardResetServerV2),
            0x09 => Ok(PacketCode::DataV2),
            other => Err(Error::UnknownOpcode(other)),
        }
    }

    /// The 5-bit wire value
    pub const fn as_wire(self) -> u8 {
        self as u8
    }

    /// Whether this opcode belongs to the data channel
    pub const fn is_data(self) -> bool {
        matches!(self, PacketCode::DataV1 | PacketCode::DataV2)
    }

    /// Whether this opcode carries a control packet id
    pub const fn is_reliable(self) -> bool {
        !self.is_data() && !matches!(self, PacketCode::AckV1)
    }
}

/// Build the leading opcode/key-id byte
pub const fn opcode_byte(code: PacketCode, key_id: u8) -> u8 {
    (code.as_wire() << 3) | (key_id & 0x07)
}

/// Split the leading byte into `(code, key_id)`
pub fn parse_opcode_byte(byte: u8) -> Result<(PacketCode, u8)> {
    let code = PacketCode::from_wire(byte >> 3)?;
    Ok((code, byte & 0x07))
}

/// A decoded control-channel packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// Packet opcode
    pub code: PacketCode,
    /// Key generation the packet belongs to (0-7)
    pub key_id: u8,
    /// Sender's session id
    pub session_id: SessionId,
    /// Packet ids being acknowledged (up to 255)
    pub ack_ids: Vec<u32>,
    /// Receiver's session id, present iff `ack_ids` is non-empty
    pub ack_remote_session_id: Option<SessionId>,
    /// Reliability packet id; `None` for pure acks
    pub packet_id: Option<u32>,
    /// Opaque payload (TLS records during the handshake phase)
    pub payload: Vec<u8>,
}

impl ControlPacket {
    /// Create a non-ack control packet
    pub fn new(
        code: PacketCode,
        key_id: u8,
        session_id: SessionId,
        packet_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            code,
            key_id,
            session_id,
            ack_ids: Vec::new(),
            ack_remote_session_id: None,
            packet_id: Some(packet_id),
            payload,
        }
    }

    /// Create a standalone ack packet
    pub fn ack(
        key_id: u8,
        session_id: SessionId,
        ack_ids: Vec<u32>,
        remote_session_id: SessionId,
    ) -> Self {
        Self {
            code: PacketCode::AckV1,
            key_id,
            session_id,
            ack_ids,
            ack_remote_session_id: Some(remote_session_id),
            packet_id: None,
            payload: Vec::new(),
        }
    }

    /// Attach piggybacked acks
    pub fn with_acks(mut self, ack_ids: Vec<u32>, remote_session_id: SessionId) -> Self {
        if !ack_ids.is_empty() {
            self.ack_ids = ack_ids;
            self.ack_remote_session_id = Some(remote_session_id);
        }
        self
    }

    /// Serialize to wire bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + SESSION_ID_LEN
                + 1
                + self.ack_ids.len() * PACKET_ID_LEN
                + SESSION_ID_LEN
                + PACKET_ID_LEN
                + self.payload.len(),
        );
        buf.push(opcode_byte(self.code, self.key_id));
        buf.extend_from_slice(self.session_id.as_bytes());

        debug_assert!(self.ack_ids.len() <= MAX_ACKS_PER_PACKET);
        buf.push(self.ack_ids.len() as u8);
        for id in &self.ack_ids {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        if !self.ack_ids.is_empty() {
            if let Some(remote) = self.ack_remote_session_id {
                buf.extend_from_slice(remote.as_bytes());
            }
        }

        if self.code != PacketCode::AckV1 {
            if let Some(packet_id) = self.packet_id {
                buf.extend_from_slice(&packet_id.to_be_bytes());
            }
            buf.extend_from_slice(&self.payload);
        }
        buf
    }

    /// Parse from wire bytes
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let min = 1 + SESSION_ID_LEN + 1;
        if buf.len() < min {
            return Err(Error::PacketTooShort {
                expected: min,
                actual: buf.len(),
            });
        }

        let (code, key_id) = parse_opcode_byte(buf[0])?;
        if code.is_data() {
            return Err(Error::InvalidPacket);
        }

        let session_id =
            SessionId::from_slice(&buf[1..1 + SESSION_ID_LEN]).ok_or(Error::InvalidPacket)?;
        let mut offset = 1 + SESSION_ID_LEN;

        let ack_count = buf[offset] as usize;
        offset += 1;

        let mut needed = offset + ack_count * PACKET_ID_LEN;
        if ack_count > 0 {
            needed += SESSION_ID_LEN;
        }
        if code != PacketCode::AckV1 {
            needed += PACKET_ID_LEN;
        }
        if buf.len() < needed {
            return Err(Error::PacketTooShort {
                expected: needed,
                actual: buf.len(),
            });
        }

        let mut ack_ids = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            let id = u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
            ack_ids.push(id);
            offset += PACKET_ID_LEN;
        }

        let ack_remote_session_id = if ack_count > 0 {
            let sid = SessionId::from_slice(&buf[offset..offset + SESSION_ID_LEN])
                .ok_or(Error::InvalidPacket)?;
            offset += SESSION_ID_LEN;
            Some(sid)
        } else {
            None
        };

        let (packet_id, payload) = if code == PacketCode::AckV1 {
            (None, Vec::new())
        } else {
            let id = u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
            offset += PACKET_ID_LEN;
            (Some(id), buf[offset..].to_vec())
        };

        Ok(Self {
            code,
            key_id,
            session_id,
            ack_ids,
            ack_remote_session_id,
            packet_id,
            payload,
        })
    }
}

/// Parsed header of a data-channel packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Packet opcode (`DataV1` or `DataV2`)
    pub code: PacketCode,
    /// Key generation (0-7)
    pub key_id: u8,
    /// 24-bit peer id (V2 only)
    pub peer_id: Option<u32>,
    /// Offset at which the ciphertext begins
    pub payload_offset: usize,
}

impl DataHeader {
    /// Parse the data header from a raw frame
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::PacketTooShort {
                expected: 1,
                actual: 0,
            });
        }
        let (code, key_id) = parse_opcode_byte(buf[0])?;
        match code {
            PacketCode::DataV1 => Ok(Self {
                code,
                key_id,
                peer_id: None,
                payload_offset: 1,
            }),
            PacketCode::DataV2 => {
                if buf.len() < 4 {
                    return Err(Error::PacketTooShort {
                        expected: 4,
                        actual: buf.len(),
                    });
                }
                let peer_id = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
                Ok(Self {
                    code,
                    key_id,
                    peer_id: Some(peer_id),
                    payload_offset: 4,
                })
            }
            _ => Err(Error::InvalidPacket),
        }
    }

    /// Encode a data V2 prefix (opcode/key-id byte plus 3-byte peer id)
    pub fn encode_v2(key_id: u8, peer_id: u32, out: &mut Vec<u8>) {
        out.push(opcode_byte(PacketCode::DataV2, key_id));
        let id = peer_id.to_be_bytes();
        out.extend_from_slice(&id[1..4]);
    }

    /// Encode a data V1 prefix (opcode/key-id byte only)
    pub fn encode_v1(key_id: u8, out: &mut Vec<u8>) {
        out.push(opcode_byte(PacketCode::DataV1, key_id));
    }
}
