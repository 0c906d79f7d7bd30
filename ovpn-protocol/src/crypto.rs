//! Cryptographic primitives for the control and data channels
//!
//! AES-CBC with Encrypt-Then-MAC, AES-GCM, standalone HMAC and the small
//! helpers the rest of the crate builds on. Key material is sliced out of
//! [`SecureBytes`](crate::SecureBytes) buffers by the callers; nothing here
//! retains secrets.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::KeyInit;
use hmac::{Hmac, Mac};
use md5::{Digest as _, Md5};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type Aes128Gcm = aes_gcm::Aes128Gcm;
type Aes192Gcm = aes_gcm::AesGcm<aes::Aes192, aes_gcm::aead::consts::U12>;
type Aes256Gcm = aes_gcm::Aes256Gcm;

/// AES block / CBC IV size
pub const CBC_IV_LEN: usize = 16;

/// AEAD nonce size (4-byte packet id plus 8-byte implicit IV)
pub const GCM_NONCE_LEN: usize = 12;

/// AEAD tag size
pub const GCM_TAG_LEN: usize = 16;

/// Data-channel cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
}

impl Cipher {
    /// The OpenVPN wire name, as it appears in pushed options
    pub const fn name(self) -> &'static str {
        match self {
            Cipher::Aes128Cbc => "AES-128-CBC",
            Cipher::Aes192Cbc => "AES-192-CBC",
            Cipher::Aes256Cbc => "AES-256-CBC",
            Cipher::Aes128Gcm => "AES-128-GCM",
            Cipher::Aes192Gcm => "AES-192-GCM",
            Cipher::Aes256Gcm => "AES-256-GCM",
        }
    }

    /// Parse an OpenVPN cipher name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES-128-CBC" => Some(Cipher::Aes128Cbc),
            "AES-192-CBC" => Some(Cipher::Aes192Cbc),
            "AES-256-CBC" => Some(Cipher::Aes256Cbc),
            "AES-128-GCM" => Some(Cipher::Aes128Gcm),
            "AES-192-GCM" => Some(Cipher::Aes192Gcm),
            "AES-256-GCM" => Some(Cipher::Aes256Gcm),
            _ => None,
        }
    }

    /// Key length in bytes
    pub const fn key_len(self) -> usize {
        match self {
            Cipher::Aes128Cbc | Cipher::Aes128Gcm => 16,
            Cipher::Aes192Cbc | Cipher::Aes192Gcm => 24,
            Cipher::Aes256Cbc | Cipher::Aes256Gcm => 32,
        }
    }

    /// Whether this suite is an AEAD (GCM) mode
    pub const fn is_aead(self) -> bool {
        matches!(
            self,
            Cipher::Aes128Gcm | Cipher::Aes192Gcm | Cipher::Aes256Gcm
        )
    }
}

impl std::fmt::Display for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// HMAC digests for CBC mode and `--tls-auth`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    /// The OpenVPN wire name
    pub const fn name(self) -> &'static str {
        match self {
            Digest::Sha1 => "SHA1",
            Digest::Sha224 => "SHA224",
            Digest::Sha256 => "SHA256",
            Digest::Sha384 => "SHA384",
            Digest::Sha512 => "SHA512",
        }
    }

    /// Parse an OpenVPN digest name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA1" | "SHA-1" => Some(Digest::Sha1),
            "SHA224" | "SHA-224" => Some(Digest::Sha224),
            "SHA256" | "SHA-256" => Some(Digest::Sha256),
            "SHA384" | "SHA-384" => Some(Digest::Sha384),
            "SHA512" | "SHA-512" => Some(Digest::Sha512),
            _ => None,
        }
    }

    /// HMAC output length in bytes
    pub const fn hmac_len(self) -> usize {
        match self {
            Digest::Sha1 => 20,
            Digest::Sha224 => 28,
            Digest::Sha256 => 32,
            Digest::Sha384 => 48,
            Digest::Sha512 => 64,
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

macro_rules! hmac_over {
    ($digest:ty, $key:expr, $chunks:expr) => {{
        let mut mac = <Hmac<$digest> as Mac>::new_from_slice($key)
            .expect("HMAC accepts keys of any length");
        for chunk in $chunks {
            mac.update(chunk);
        }
        mac.finalize().into_bytes().to_vec()
    }};
}

/// HMAC over the concatenation of `chunks`
pub fn hmac(digest: Digest, key: &[u8], chunks: &[&[u8]]) -> Vec<u8> {
    match digest {
        Digest::Sha1 => hmac_over!(Sha1, key, chunks),
        Digest::Sha224 => hmac_over!(Sha224, key, chunks),
        Digest::Sha256 => hmac_over!(Sha256, key, chunks),
        Digest::Sha384 => hmac_over!(Sha384, key, chunks),
        Digest::Sha512 => hmac_over!(Sha512, key, chunks),
    }
}

/// Constant-time HMAC verification
pub fn hmac_verify(digest: Digest, key: &[u8], chunks: &[&[u8]], expected: &[u8]) -> bool {
    let computed = hmac(digest, key, chunks);
    computed.len() == expected.len() && bool::from(computed.ct_eq(expected))
}

/// Cryptographically secure random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// MD5 digest of a PEM file's contents.
///
/// Only used to build the CA-bound hard-reset payload some providers
/// require; nothing else in the engine relies on MD5.
pub fn pem_md5(pem: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(pem));
    out
}

macro_rules! cbc_encrypt_with {
    ($enc:ty, $key:expr, $iv:expr, $plaintext:expr) => {{
        let cipher = <$enc>::new_from_slices($key, $iv)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        let padded_len = ($plaintext.len() / CBC_IV_LEN + 1) * CBC_IV_LEN;
        let mut buf = vec![0u8; padded_len];
        buf[..$plaintext.len()].copy_from_slice($plaintext);
        let written = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buf, $plaintext.len())
            .map_err(|e| Error::Encryption(e.to_string()))?
            .len();
        buf.truncate(written);
        Ok(buf)
    }};
}

macro_rules! cbc_decrypt_with {
    ($dec:ty, $key:expr, $iv:expr, $ciphertext:expr) => {{
        let cipher = <$dec>::new_from_slices($key, $iv)
            .map_err(|e| Error::Decryption(e.to_string()))?;
        let mut buf = $ciphertext.to_vec();
        let written = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|e| Error::Decryption(e.to_string()))?
            .len();
        buf.truncate(written);
        Ok(buf)
    }};
}

/// AES-CBC encrypt with PKCS7 padding
pub(crate) fn cbc_encrypt(
    cipher: Cipher,
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    match cipher {
        Cipher::Aes128Cbc => cbc_encrypt_with!(Aes128CbcEnc, key, iv, plaintext),
        Cipher::Aes192Cbc => cbc_encrypt_with!(Aes192CbcEnc, key, iv, plaintext),
        Cipher::Aes256Cbc => cbc_encrypt_with!(Aes256CbcEnc, key, iv, plaintext),
        _ => Err(Error::Encryption(format!("{} is not a CBC suite", cipher))),
    }
}

/// AES-CBC decrypt with PKCS7 padding
pub(crate) fn cbc_decrypt(
    cipher: Cipher,
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    match cipher {
        Cipher::Aes128Cbc => cbc_decrypt_with!(Aes128CbcDec, key, iv, ciphertext),
        Cipher::Aes192Cbc => cbc_decrypt_with!(Aes192CbcDec, key, iv, ciphertext),
        Cipher::Aes256Cbc => cbc_decrypt_with!(Aes256CbcDec, key, iv, ciphertext),
        _ => Err(Error::Decryption(format!("{} is not a CBC suite", cipher))),
    }
}

macro_rules! gcm_seal_with {
    ($gcm:ty, $key:expr, $nonce:expr, $aad:expr, $plaintext:expr) => {{
        let cipher =
            <$gcm>::new_from_slice($key).map_err(|e| Error::Encryption(e.to_string()))?;
        cipher
            .encrypt(
                GenericArray::from_slice($nonce),
                Payload {
                    msg: $plaintext,
                    aad: $aad,
                },
            )
            .map_err(|_| Error::Encryption("AEAD seal failed".to_string()))
    }};
}

macro_rules! gcm_open_with {
    ($gcm:ty, $key:expr, $nonce:expr, $aad:expr, $ciphertext:expr) => {{
        let cipher =
            <$gcm>::new_from_slice($key).map_err(|e| Error::Decryption(e.to_string()))?;
        cipher
            .decrypt(
                GenericArray::from_slice($nonce),
                Payload {
                    msg: $ciphertext,
                    aad: $aad,
                },
            )
            .map_err(|_| Error::Decryption("AEAD tag verification failed".to_string()))
    }};
}

/// AES-GCM seal; returns ciphertext with the 16-byte tag appended
pub(crate) fn gcm_seal(
    cipher: Cipher,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    match cipher {
        Cipher::Aes128Gcm => gcm_seal_with!(Aes128Gcm, key, nonce, aad, plaintext),
        Cipher::Aes192Gcm => gcm_seal_with!(Aes192Gcm, key, nonce, aad, plaintext),
        Cipher::Aes256Gcm => gcm_seal_with!(Aes256Gcm, key, nonce, aad, plaintext),
        _ => Err(Error::Encryption(format!("{} is not an AEAD suite", cipher))),
    }
}

/// AES-GCM open; `ciphertext` carries the 16-byte tag appended
pub(crate) fn gcm_open(
    cipher: Cipher,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    match cipher {
        Cipher::Aes128Gcm => gcm_open_with!(Aes128Gcm, key, nonce, aad, ciphertext),
        Cipher::Aes192Gcm => gcm_open_with!(Aes192Gcm, key, nonce, aad, ciphertext),
        Cipher::Aes256Gcm => gcm_open_with!(Aes256Gcm, key, nonce, aad, ciphertext),
        _ => Err(Error::Decryption(format!("{} is not an AEAD suite", cipher))),
    }
}

/// AES-256-CTR keystream application (encrypts and decrypts)
pub(crate) fn aes256_ctr_apply(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let mut cipher =
        Aes256Ctr::new_from_slices(key, iv).map_err(|e| Error::Encryption(e.to_string()))?;
    cipher.apply_keystream(data);
    Ok(())
}
