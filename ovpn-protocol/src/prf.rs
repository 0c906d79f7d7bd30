//! Data-channel key derivation
//!
//! OpenVPN derives its data-channel keys with the TLS 1.0/1.1 PRF applied
//! twice: once to turn the pre-master secret into a 48-byte master secret,
//! once to expand the master secret into 256 bytes of key material.
//! The PRF splits the secret in half and XORs P_MD5 of the first half with
//! P_SHA1 of the second half (RFC 2246 §5).

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;

use crate::secure::SecureBytes;
use crate::session::SessionId;

const MASTER_SECRET_LABEL: &[u8] = b"OpenVPN master secret";
const KEY_EXPANSION_LABEL: &[u8] = b"OpenVPN key expansion";

const MASTER_SECRET_LEN: usize = 48;
const KEY_MATERIAL_LEN: usize = 256;
const KEY_SLOT_LEN: usize = 64;

const PRE_MASTER_LEN: usize = 48;
const RANDOM_LEN: usize = 32;

macro_rules! p_hash_with {
    ($digest:ty, $secret:expr, $seed:expr, $out_len:expr) => {{
        let mut out = SecureBytes::with_capacity($out_len);
        let mut a = {
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice($secret)
                .expect("HMAC accepts keys of any length");
            mac.update($seed);
            mac.finalize().into_bytes()
        };
        while out.len() < $out_len {
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice($secret)
                .expect("HMAC accepts keys of any length");
            mac.update(&a);
            mac.update($seed);
            let block = mac.finalize().into_bytes();
            let take = ($out_len - out.len()).min(block.len());
            out.append(&block[..take]);

            let mut mac = <Hmac<$digest> as Mac>::new_from_slice($secret)
                .expect("HMAC accepts keys of any length");
            mac.update(&a);
            a = mac.finalize().into_bytes();
        }
        out
    }};
}

/// TLS 1.0/1.1 pseudo-random function: P_MD5 ⊕ P_SHA1 over the split secret
pub fn tls1_prf(secret: &[u8], label: &[u8], seed_parts: &[&[u8]], out_len: usize) -> SecureBytes {
    let mut seed = SecureBytes::with_capacity(label.len() + 64);
    seed.append(label);
    for part in seed_parts {
        seed.append(part);
    }

    // The halves overlap by one byte when the secret length is odd
    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    let md5_out = p_hash_with!(Md5, s1, seed.as_slice(), out_len);
    let sha1_out = p_hash_with!(Sha1, s2, seed.as_slice(), out_len);

    let mut out = SecureBytes::with_capacity(out_len);
    for (a, b) in md5_out.iter().zip(sha1_out.iter()) {
        out.append_u8(a ^ b);
    }
    out
}

/// Client-side contribution to the key exchange: the pre-master secret and
/// the two client randoms, generated fresh per negotiation.
#[derive(Debug)]
pub struct KeySource {
    /// 48-byte pre-master secret
    pub pre_master: SecureBytes,
    /// First client random, mixed into the master secret
    pub random1: SecureBytes,
    /// Second client random, mixed into the key expansion
    pub random2: SecureBytes,
}

impl KeySource {
    /// Generate a fresh key source
    pub fn random() -> Self {
        Self {
            pre_master: SecureBytes::random(PRE_MASTER_LEN),
            random1: SecureBytes::random(RANDOM_LEN),
            random2: SecureBytes::random(RANDOM_LEN),
        }
    }

    /// Build from fixed bytes (test vectors, scripted negotiations)
    pub fn from_parts(pre_master: &[u8], random1: &[u8], random2: &[u8]) -> Self {
        Self {
            pre_master: SecureBytes::from(pre_master),
            random1: SecureBytes::from(random1),
            random2: SecureBytes::from(random2),
        }
    }
}

/// Server-side randoms parsed from the key-material handshake reply
#[derive(Debug)]
pub struct ServerKeySource {
    pub random1: SecureBytes,
    pub random2: SecureBytes,
}

impl ServerKeySource {
    pub fn new(random1: &[u8], random2: &[u8]) -> Self {
        Self {
            random1: SecureBytes::from(random1),
            random2: SecureBytes::from(random2),
        }
    }
}

/// 256 bytes of expanded key material, split into four 64-byte slots:
/// encrypt key, decrypt key, encrypt HMAC key, decrypt HMAC key
/// (client perspective).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelKeys {
    material: SecureBytes,
}

impl DataChannelKeys {
    /// Wrap pre-expanded material (must be 256 bytes)
    pub fn from_material(material: SecureBytes) -> crate::Result<Self> {
        if material.len() != KEY_MATERIAL_LEN {
            return Err(crate::Error::KeyMaterial(format!(
                "expected {} bytes of key material, got {}",
                KEY_MATERIAL_LEN,
                material.len()
            )));
        }
        Ok(Self { material })
    }

    pub fn encrypt_key(&self) -> &[u8] {
        &self.material.as_slice()[..KEY_SLOT_LEN]
    }

    pub fn decrypt_key(&self) -> &[u8] {
        &self.material.as_slice()[KEY_SLOT_LEN..2 * KEY_SLOT_LEN]
    }

    pub fn encrypt_hmac_key(&self) -> &[u8] {
        &self.material.as_slice()[2 * KEY_SLOT_LEN..3 * KEY_SLOT_LEN]
    }

    pub fn decrypt_hmac_key(&self) -> &[u8] {
        &self.material.as_slice()[3 * KEY_SLOT_LEN..]
    }
}

/// Expand the negotiated secrets into data-channel key material.
///
/// `master = PRF(pre_master, "OpenVPN master secret", r1 ∥ sr1)`;
/// `material = PRF(master, "OpenVPN key expansion", r2 ∥ sr2 ∥ lsid ∥ rsid)`.
/// Deterministic in all inputs.
pub fn derive_data_channel_keys(
    client: &KeySource,
    server: &ServerKeySource,
    local_session_id: &SessionId,
    remote_session_id: &SessionId,
) -> DataChannelKeys {
    let master = tls1_prf(
        &client.pre_master,
        MASTER_SECRET_LABEL,
        &[&client.random1, &server.random1],
        MASTER_SECRET_LEN,
    );
    let material = tls1_prf(
        &master,
        KEY_EXPANSION_LABEL,
        &[
            &client.random2,
            &server.random2,
            local_session_id.as_bytes(),
            remote_session_id.as_bytes(),
        ],
        KEY_MATERIAL_LEN,
    );
    DataChannelKeys { material }
}
