//! Control-channel TLS wrapping (`--tls-auth` / `--tls-crypt`)
//!
//! Both modes extend control packets with a replay id and timestamp and
//! authenticate them with a pre-shared static key, closing the
//! pre-handshake attack surface. `crypt` additionally encrypts everything
//! after the opcode and session id with AES-256-CTR, using the HMAC tag as
//! the counter IV (tag-SIV construction).

use crate::crypto::{self, Digest};
use crate::packet::SESSION_ID_LEN;
use crate::secure::SecureBytes;
use crate::{Error, Result};

/// Opcode byte plus session id; never wrapped, always on the wire in clear
const WRAP_HEAD_LEN: usize = 1 + SESSION_ID_LEN;

/// Replay id plus timestamp
const WRAP_EXT_LEN: usize = 8;

/// Static key file length
const STATIC_KEY_LEN: usize = 256;

/// Subkey length within the static key
const STATIC_SUBKEY_LEN: usize = 64;

/// AES-256-CTR / HMAC-SHA256 key length used by `crypt` mode
const CRYPT_KEY_LEN: usize = 32;

const KEY_FILE_HEADER: &str = "-----BEGIN OpenVPN Static key V1-----";
const KEY_FILE_FOOTER: &str = "-----END OpenVPN Static key V1-----";

/// Pre-shared 256-byte static key, split into four 64-byte subkeys:
/// encrypt key, decrypt key, encrypt HMAC key, decrypt HMAC key
/// (client perspective).
#[derive(Clone)]
pub struct StaticKey {
    material: SecureBytes,
}

impl StaticKey {
    /// Wrap raw key material (must be exactly 256 bytes)
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != STATIC_KEY_LEN {
            return Err(Error::KeyMaterial(format!(
                "static key must be {} bytes, got {}",
                STATIC_KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            material: SecureBytes::from(bytes),
        })
    }

    /// Parse the armored OpenVPN static key file format: hex lines between
    /// the `BEGIN`/`END OpenVPN Static key V1` markers.
    pub fn from_key_file(text: &str) -> Result<Self> {
        let body = text
            .split(KEY_FILE_HEADER)
            .nth(1)
            .and_then(|rest| rest.split(KEY_FILE_FOOTER).next())
            .ok_or_else(|| Error::KeyMaterial("missing static key markers".to_string()))?;

        let mut material = SecureBytes::with_capacity(STATIC_KEY_LEN);
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
                continue;
            }
            if line.len() % 2 != 0 {
                return Err(Error::KeyMaterial("odd-length hex line".to_string()));
            }
            for i in (0..line.len()).step_by(2) {
                let byte = u8::from_str_radix(&line[i..i + 2], 16)
                    .map_err(|_| Error::KeyMaterial("invalid hex in static key".to_string()))?;
                material.append_u8(byte);
            }
        }

        if material.len() != STATIC_KEY_LEN {
            return Err(Error::KeyMaterial(format!(
                "static key must decode to {} bytes, got {}",
                STATIC_KEY_LEN,
                material.len()
            )));
        }
        Ok(Self { material })
    }

    pub fn encrypt_key(&self) -> &[u8] {
        &self.material.as_slice()[..STATIC_SUBKEY_LEN]
    }

    pub fn decrypt_key(&self) -> &[u8] {
        &self.material.as_slice()[STATIC_SUBKEY_LEN..2 * STATIC_SUBKEY_LEN]
    }

    pub fn encrypt_hmac_key(&self) -> &[u8] {
        &self.material.as_slice()[2 * STATIC_SUBKEY_LEN..3 * STATIC_SUBKEY_LEN]
    }

    pub fn decrypt_hmac_key(&self) -> &[u8] {
        &self.material.as_slice()[3 * STATIC_SUBKEY_LEN..]
    }
}

impl std::fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StaticKey(256 bytes)")
    }
}

/// Which wrapping mode the control channel runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapStrategy {
    /// Authenticate-only (`--tls-auth`)
    Auth,
    /// Encrypt and authenticate (`--tls-crypt`)
    Crypt,
}

/// Stateful wrapper/unwrapper for control packets.
///
/// Tracks the outbound replay counter and enforces monotonicity of the
/// inbound replay id and timestamp.
pub struct TlsWrap {
    strategy: WrapStrategy,
    key: StaticKey,
    digest: Digest,
    tx_replay_id: u32,
    last_rx_replay_id: u32,
    last_rx_timestamp: u32,
}

impl TlsWrap {
    /// `--tls-auth` with the given HMAC digest
    pub fn auth(key: StaticKey, digest: Digest) -> Self {
        Self {
            strategy: WrapStrategy::Auth,
            key,
            digest,
            tx_replay_id: 0,
            last_rx_replay_id: 0,
            last_rx_timestamp: 0,
        }
    }

    /// `--tls-crypt` (AES-256-CTR + HMAC-SHA256)
    pub fn crypt(key: StaticKey) -> Self {
        Self {
            strategy: WrapStrategy::Crypt,
            key,
            digest: Digest::Sha256,
            tx_replay_id: 0,
            last_rx_replay_id: 0,
            last_rx_timestamp: 0,
        }
    }

    pub fn strategy(&self) -> WrapStrategy {
        self.strategy
    }

    /// Wrap a serialized plain control packet for transmission.
    ///
    /// `plain` must start with the opcode byte and session id;
    /// `timestamp` is seconds since the Unix epoch.
    pub fn wrap(&mut self, plain: &[u8], timestamp: u32) -> Result<Vec<u8>> {
        if plain.len() < WRAP_HEAD_LEN {
            return Err(Error::PacketTooShort {
                expected: WRAP_HEAD_LEN,
                actual: plain.len(),
            });
        }
        let (head, rest) = plain.split_at(WRAP_HEAD_LEN);

        self.tx_replay_id = self.tx_replay_id.wrapping_add(1);
        let replay = self.tx_replay_id.to_be_bytes();
        let time = timestamp.to_be_bytes();

        match self.strategy {
            WrapStrategy::Auth => {
                let hmac_key = &self.key.encrypt_hmac_key()[..self.digest.hmac_len()];
                let tag = crypto::hmac(self.digest, hmac_key, &[&replay, &time, head, rest]);

                let mut out =
                    Vec::with_capacity(plain.len() + tag.len() + WRAP_EXT_LEN);
                out.extend_from_slice(head);
                out.extend_from_slice(&tag);
                out.extend_from_slice(&replay);
                out.extend_from_slice(&time);
                out.extend_from_slice(rest);
                Ok(out)
            }
            WrapStrategy::Crypt => {
                let hmac_key = &self.key.encrypt_hmac_key()[..CRYPT_KEY_LEN];
                let tag = crypto::hmac(Digest::Sha256, hmac_key, &[head, &replay, &time, rest]);

                let mut ciphertext = rest.to_vec();
                let cipher_key = &self.key.encrypt_key()[..CRYPT_KEY_LEN];
                crypto::aes256_ctr_apply(cipher_key, &tag[..16], &mut ciphertext)?;

                let mut out =
                    Vec::with_capacity(plain.len() + tag.len() + WRAP_EXT_LEN);
                out.extend_from_slice(head);
                out.extend_from_slice(&replay);
                out.extend_from_slice(&time);
                out.extend_from_slice(&tag);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Unwrap a received packet back into plain control packet bytes
    /// (opcode, session id, then the original remainder).
    pub fn unwrap_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let tag_len = match self.strategy {
            WrapStrategy::Auth => self.digest.hmac_len(),
            WrapStrategy::Crypt => Digest::Sha256.hmac_len(),
        };
        let min = WRAP_HEAD_LEN + tag_len + WRAP_EXT_LEN;
        if packet.len() < min {
            return Err(Error::PacketTooShort {
                expected: min,
                actual: packet.len(),
            });
        }

        let head = &packet[..WRAP_HEAD_LEN];
        let (replay_id, timestamp, rest) = match self.strategy {
            WrapStrategy::Auth => {
                let tag = &packet[WRAP_HEAD_LEN..WRAP_HEAD_LEN + tag_len];
                let ext = &packet[WRAP_HEAD_LEN + tag_len..WRAP_HEAD_LEN + tag_len + WRAP_EXT_LEN];
                let rest = &packet[WRAP_HEAD_LEN + tag_len + WRAP_EXT_LEN..];

                let hmac_key = &self.key.decrypt_hmac_key()[..self.digest.hmac_len()];
                if !crypto::hmac_verify(
                    self.digest,
                    hmac_key,
                    &[&ext[..4], &ext[4..], head, rest],
                    tag,
                ) {
                    return Err(Error::Decryption(
                        "control packet HMAC verification failed".to_string(),
                    ));
                }
                (
                    u32::from_be_bytes([ext[0], ext[1], ext[2], ext[3]]),
                    u32::from_be_bytes([ext[4], ext[5], ext[6], ext[7]]),
                    rest.to_vec(),
                )
            }
            WrapStrategy::Crypt => {
                let ext = &packet[WRAP_HEAD_LEN..WRAP_HEAD_LEN + WRAP_EXT_LEN];
                let tag = &packet[WRAP_HEAD_LEN + WRAP_EXT_LEN..WRAP_HEAD_LEN + WRAP_EXT_LEN + tag_len];
                let ciphertext = &packet[WRAP_HEAD_LEN + WRAP_EXT_LEN + tag_len..];

                let mut plain = ciphertext.to_vec();
                let cipher_key = &self.key.decrypt_key()[..CRYPT_KEY_LEN];
                crypto::aes256_ctr_apply(cipher_key, &tag[..16], &mut plain)?;

                let hmac_key = &self.key.decrypt_hmac_key()[..CRYPT_KEY_LEN];
                if !crypto::hmac_verify(
                    Digest::Sha256,
                    hmac_key,
                    &[head, &ext[..4], &ext[4..], &plain],
                    tag,
                ) {
                    return Err(Error::Decryption(
                        "control packet HMAC verification failed".to_string(),
                    ));
                }
                (
                    u32::from_be_bytes([ext[0], ext[1], ext[2], ext[3]]),
                    u32::from_be_bytes([ext[4], ext[5], ext[6], ext[7]]),
                    plain,
                )
            }
        };

        // Replay ids must strictly increase, timestamps must not go back
        if replay_id <= self.last_rx_replay_id || timestamp < self.last_rx_timestamp {
            return Err(Error::ControlReplay);
        }
        self.last_rx_replay_id = replay_id;
        self.last_rx_timestamp = timestamp;

        let mut plain = Vec::with_capacity(WRAP_HEAD_LEN + rest.len());
        plain.extend_from_slice(head);
        plain.extend_from_slice(&rest);
        Ok(plain)
    }
}
