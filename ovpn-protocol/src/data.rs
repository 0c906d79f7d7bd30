//! Per-key data path
//!
//! Encrypts and decrypts tunnel IP packets for one key generation.
//! CBC suites use Encrypt-Then-MAC with the packet id carried inside the
//! plaintext; AEAD suites carry the packet id on the wire as the explicit
//! nonce half. Compression is never performed: the framing byte only
//! signals the no-compression stub to servers configured with
//! `comp-lzo` / `compress`.
//!
//! Wire layouts after the data header (opcode/key-id byte, peer id for V2):
//!
//! ```text
//! CBC:  hmac | iv (16) | AES-CBC(packet_id | framing? | ip packet)
//! GCM:  packet_id (4) | tag (16) | AES-GCM(framing? | ip packet)
//! ```

use crate::crypto::{self, Cipher, Digest, CBC_IV_LEN, GCM_TAG_LEN};
use crate::packet::{DataHeader, PacketCode, PEER_ID_DISABLED};
use crate::prf::DataChannelKeys;
use crate::replay::ReplayWindow;
use crate::{Error, Result};

/// Compression framing negotiated for the data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionFraming {
    /// No framing byte at all
    #[default]
    Disabled,
    /// `comp-lzo` framing: 0xFA marks an uncompressed payload
    CompLzo,
    /// OpenVPN 2.4 `compress` framing: 0xFB marks an uncompressed payload
    Compress,
}

impl CompressionFraming {
    /// The no-compression marker byte, if framing is active
    pub const fn marker(self) -> Option<u8> {
        match self {
            CompressionFraming::Disabled => None,
            CompressionFraming::CompLzo => Some(0xFA),
            CompressionFraming::Compress => Some(0xFB),
        }
    }
}

/// AEAD implicit IV length (appended to the 4-byte packet id)
const IMPLICIT_IV_LEN: usize = 8;

/// Encrypt/decrypt pipeline for one key generation
pub struct DataPath {
    key_id: u8,
    cipher: Cipher,
    digest: Digest,
    framing: CompressionFraming,
    /// Peer id stamped into outbound V2 frames
    peer_id: u32,
    keys: DataChannelKeys,
    /// Last outbound packet id used (ids start at 1)
    tx_packet_id: u32,
    replay: ReplayWindow,
}

impl DataPath {
    /// Build a data path from derived key material.
    ///
    /// `peer_id` of `None` stamps the disabled sentinel into outbound
    /// frames, as OpenVPN does when the server pushed no peer id.
    pub fn new(
        key_id: u8,
        keys: DataChannelKeys,
        cipher: Cipher,
        digest: Digest,
        framing: CompressionFraming,
        peer_id: Option<u32>,
    ) -> Self {
        Self {
            key_id,
            cipher,
            digest,
            framing,
            peer_id: peer_id.unwrap_or(PEER_ID_DISABLED),
            keys,
            tx_packet_id: 0,
            replay: ReplayWindow::new(),
        }
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    /// Encrypt one IP packet into a complete data V2 frame
    pub fn encrypt(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        self.tx_packet_id = self.tx_packet_id.wrapping_add(1);
        let packet_id = self.tx_packet_id.to_be_bytes();

        let mut frame = Vec::with_capacity(packet.len() + 64);
        DataHeader::encode_v2(self.key_id, self.peer_id, &mut frame);

        if self.cipher.is_aead() {
            let mut nonce = [0u8; 12];
            nonce[..4].copy_from_slice(&packet_id);
            nonce[4..].copy_from_slice(&self.keys.encrypt_hmac_key()[..IMPLICIT_IV_LEN]);

            // AD: opcode/key-id byte, peer id, packet id
            let mut ad = frame.clone();
            ad.extend_from_slice(&packet_id);

            let mut plaintext = Vec::with_capacity(packet.len() + 1);
            if let Some(marker) = self.framing.marker() {
                plaintext.push(marker);
            }
            plaintext.extend_from_slice(packet);

            let key = &self.keys.encrypt_key()[..self.cipher.key_len()];
            let sealed = crypto::gcm_seal(self.cipher, key, &nonce, &ad, &plaintext)?;
            let (ciphertext, tag) = sealed.split_at(sealed.len() - GCM_TAG_LEN);

            frame.extend_from_slice(&packet_id);
            frame.extend_from_slice(tag);
            frame.extend_from_slice(ciphertext);
        } else {
            let mut plaintext = Vec::with_capacity(packet.len() + 5);
            plaintext.extend_from_slice(&packet_id);
            if let Some(marker) = self.framing.marker() {
                plaintext.push(marker);
            }
            plaintext.extend_from_slice(packet);

            let iv = crypto::random_bytes(CBC_IV_LEN);
            let key = &self.keys.encrypt_key()[..self.cipher.key_len()];
            let ciphertext = crypto::cbc_encrypt(self.cipher, key, &iv, &plaintext)?;

            let hmac_key = &self.keys.encrypt_hmac_key()[..self.digest.hmac_len()];
            let mac = crypto::hmac(self.digest, hmac_key, &[&iv, &ciphertext]);

            frame.extend_from_slice(&mac);
            frame.extend_from_slice(&iv);
            frame.extend_from_slice(&ciphertext);
        }
        Ok(frame)
    }

    /// Decrypt a complete data frame back into the carried IP packet.
    ///
    /// Authenticates, replay-checks the packet id, verifies the peer id
    /// and strips the compression framing marker.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let header = DataHeader::parse(frame)?;

        if header.code == PacketCode::DataV2 {
            if let Some(peer_id) = header.peer_id {
                if peer_id != PEER_ID_DISABLED
                    && self.peer_id != PEER_ID_DISABLED
                    && peer_id != self.peer_id
                {
                    return Err(Error::PeerIdMismatch {
                        expected: self.peer_id,
                        actual: peer_id,
                    });
                }
            }
        }

        let body = &frame[header.payload_offset..];
        let plaintext = if self.cipher.is_aead() {
            let min = 4 + GCM_TAG_LEN;
            if body.len() < min {
                return Err(Error::PacketTooShort {
                    expected: header.payload_offset + min,
                    actual: frame.len(),
                });
            }
            let packet_id_bytes = &body[..4];
            let tag = &body[4..4 + GCM_TAG_LEN];
            let ciphertext = &body[4 + GCM_TAG_LEN..];

            let mut nonce = [0u8; 12];
            nonce[..4].copy_from_slice(packet_id_bytes);
            nonce[4..].copy_from_slice(&self.keys.decrypt_hmac_key()[..IMPLICIT_IV_LEN]);

            let mut ad = frame[..header.payload_offset].to_vec();
            ad.extend_from_slice(packet_id_bytes);

            let mut sealed = Vec::with_capacity(ciphertext.len() + GCM_TAG_LEN);
            sealed.extend_from_slice(ciphertext);
            sealed.extend_from_slice(tag);

            let key = &self.keys.decrypt_key()[..self.cipher.key_len()];
            let plaintext = crypto::gcm_open(self.cipher, key, &nonce, &ad, &sealed)?;

            let packet_id = u32::from_be_bytes([
                packet_id_bytes[0],
                packet_id_bytes[1],
                packet_id_bytes[2],
                packet_id_bytes[3],
            ]);
            self.replay.check_and_update(packet_id)?;
            plaintext
        } else {
            let hmac_len = self.digest.hmac_len();
            let min = hmac_len + CBC_IV_LEN;
            if body.len() < min {
                return Err(Error::PacketTooShort {
                    expected: header.payload_offset + min,
                    actual: frame.len(),
                });
            }
            let mac = &body[..hmac_len];
            let iv = &body[hmac_len..hmac_len + CBC_IV_LEN];
            let ciphertext = &body[hmac_len + CBC_IV_LEN..];

            let hmac_key = &self.keys.decrypt_hmac_key()[..hmac_len];
            if !crypto::hmac_verify(self.digest, hmac_key, &[iv, ciphertext], mac) {
                return Err(Error::Decryption(
                    "data packet HMAC verification failed".to_string(),
                ));
            }

            let key = &self.keys.decrypt_key()[..self.cipher.key_len()];
            let mut plaintext = crypto::cbc_decrypt(self.cipher, key, iv, ciphertext)?;
            if plaintext.len() < 4 {
                return Err(Error::InvalidPacket);
            }
            let packet_id =
                u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
            self.replay.check_and_update(packet_id)?;
            plaintext.drain(..4);
            plaintext
        };

        self.strip_framing(plaintext)
    }

    fn strip_framing(&self, mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
        let Some(marker) = self.framing.marker() else {
            return Ok(plaintext);
        };
        match plaintext.first() {
            Some(&byte) if byte == marker => {
                plaintext.remove(0);
                Ok(plaintext)
            }
            Some(&byte) => Err(Error::Decryption(format!(
                "unexpected compression framing byte {:#04x}; \
                 actively compressing servers are not supported",
                byte
            ))),
            None => Err(Error::InvalidPacket),
        }
    }
}
