//! Session identifiers

use std::fmt;

use rand::RngCore;

use crate::packet::SESSION_ID_LEN;

/// 8-byte opaque session identifier.
///
/// The local id is generated once per session; the remote id is learned
/// from the server's first hard reset and pinned for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a random session ID
    pub fn random() -> Self {
        let mut bytes = [0u8; SESSION_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub const fn new(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }

    /// Parse from the front of a buffer
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; SESSION_ID_LEN] = bytes.get(..SESSION_ID_LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; SESSION_ID_LEN]> for SessionId {
    fn from(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_roundtrip() {
        let sid = SessionId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(format!("{}", sid), "0102030405060708");

        let restored = SessionId::from_slice(sid.as_bytes()).unwrap();
        assert_eq!(sid, restored);
    }

    #[test]
    fn test_from_slice_too_short() {
        assert!(SessionId::from_slice(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(SessionId::random(), SessionId::random());
    }
}
