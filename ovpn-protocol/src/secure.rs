//! Scrubbed byte buffers for secret material
//!
//! Pre-master secrets, randoms, credentials and derived keys must never
//! linger in freed memory. `SecureBytes` wraps a `Vec<u8>` and zeroizes the
//! entire backing allocation on drop, on `clear` and when a consumed prefix
//! is drained.

use std::fmt;
use std::ops::{Deref, Index};

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Growable byte buffer that scrubs its backing memory
#[derive(Default)]
pub struct SecureBytes {
    inner: Vec<u8>,
}

impl SecureBytes {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self { inner: Vec::new() }
    }

    /// Create an empty buffer with pre-allocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Create a buffer filled with `len` cryptographically secure random bytes
    pub fn random(len: usize) -> Self {
        let mut inner = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut inner);
        Self { inner }
    }

    /// Length of the buffer contents
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Borrow the contents as a slice
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Append raw bytes
    pub fn append(&mut self, bytes: &[u8]) {
        self.inner.extend_from_slice(bytes);
    }

    /// Append a single byte
    pub fn append_u8(&mut self, byte: u8) {
        self.inner.push(byte);
    }

    /// Append a big-endian u16
    pub fn append_u16(&mut self, value: u16) {
        self.inner.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian u32
    pub fn append_u32(&mut self, value: u32) {
        self.inner.extend_from_slice(&value.to_be_bytes());
    }

    /// Append `bytes` preceded by their length as a 2-byte big-endian prefix
    pub fn append_length_prefixed(&mut self, bytes: &[u8]) {
        self.append_u16(bytes.len() as u16);
        self.inner.extend_from_slice(bytes);
    }

    /// Remove the first `count` bytes, scrubbing the vacated tail.
    ///
    /// Used by re-entrant parsers to release consumed prefixes of an
    /// accumulation buffer without leaving copies behind.
    pub fn drain_front(&mut self, count: usize) {
        let count = count.min(self.inner.len());
        let remaining = self.inner.len() - count;
        self.inner.copy_within(count.., 0);
        for byte in &mut self.inner[remaining..] {
            *byte = 0;
        }
        self.inner.truncate(remaining);
    }

    /// Extract a NUL-terminated string starting at `offset`.
    ///
    /// Returns the string and the index one past its terminator, or `None`
    /// if no terminator exists in the remaining bytes.
    pub fn null_terminated_string(&self, offset: usize) -> Option<(String, usize)> {
        let rest = self.inner.get(offset..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        let text = String::from_utf8_lossy(&rest[..nul]).into_owned();
        Some((text, offset + nul + 1))
    }

    /// Scrub and empty the buffer
    pub fn clear(&mut self) {
        self.inner.zeroize();
    }

    /// Render the contents as lowercase hex
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.inner.len() * 2);
        for byte in &self.inner {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        self.inner.zeroize();
    }
}

impl Clone for SecureBytes {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl Index<usize> for SecureBytes {
    type Output = u8;

    fn index(&self, index: usize) -> &u8 {
        &self.inner[index]
    }
}

impl PartialEq for SecureBytes {
    fn eq(&self, other: &Self) -> bool {
        // Secrets are compared in constant time
        self.inner.len() == other.inner.len() && self.inner.ct_eq(&other.inner).into()
    }
}

impl Eq for SecureBytes {}

impl From<&[u8]> for SecureBytes {
    fn from(bytes: &[u8]) -> Self {
        Self {
            inner: bytes.to_vec(),
        }
    }
}

impl From<Vec<u8>> for SecureBytes {
    fn from(inner: Vec<u8>) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret contents
        write!(f, "SecureBytes({} bytes)", self.inner.len())
    }
}

impl fmt::Display for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_view() {
        let mut buf = SecureBytes::new();
        buf.append(&[1, 2, 3]);
        buf.append_u8(4);
        buf.append_u16(0x0506);
        buf.append_u32(0x0708090a);
        assert_eq!(
            buf.as_slice(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
        );
        assert_eq!(buf[0], 1);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_length_prefixed() {
        let mut buf = SecureBytes::new();
        buf.append_length_prefixed(b"abc");
        assert_eq!(buf.as_slice(), &[0, 3, b'a', b'b', b'c']);

        let mut empty = SecureBytes::new();
        empty.append_length_prefixed(b"");
        assert_eq!(empty.as_slice(), &[0, 0]);
    }

    #[test]
    fn test_drain_front() {
        let mut buf = SecureBytes::from(vec![1, 2, 3, 4, 5]);
        buf.drain_front(2);
        assert_eq!(buf.as_slice(), &[3, 4, 5]);

        buf.drain_front(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_front_scrubs_tail() {
        let mut buf = SecureBytes::from(vec![0xAA; 8]);
        buf.drain_front(3);
        // Bytes past the logical end of the backing vec must be zero
        let spare = unsafe {
            std::slice::from_raw_parts(buf.inner.as_ptr().add(buf.len()), 3)
        };
        assert_eq!(spare, &[0, 0, 0]);
    }

    #[test]
    fn test_clear_scrubs_allocation() {
        let mut buf = SecureBytes::from(vec![0xFF; 32]);
        let ptr = buf.inner.as_ptr();
        let cap = buf.inner.capacity();
        buf.clear();
        assert!(buf.is_empty());
        let backing = unsafe { std::slice::from_raw_parts(ptr, cap) };
        assert!(backing.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_null_terminated_string() {
        let mut buf = SecureBytes::new();
        buf.append(b"AUTH_FAILED\0PUSH_REPLY,x\0tail");

        let (first, next) = buf.null_terminated_string(0).unwrap();
        assert_eq!(first, "AUTH_FAILED");

        let (second, next) = buf.null_terminated_string(next).unwrap();
        assert_eq!(second, "PUSH_REPLY,x");

        // "tail" has no terminator
        assert!(buf.null_terminated_string(next).is_none());
    }

    #[test]
    fn test_equality() {
        let a = SecureBytes::from(vec![1, 2, 3]);
        let b = SecureBytes::from(vec![1, 2, 3]);
        let c = SecureBytes::from(vec![1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_random_lengths_differ() {
        let a = SecureBytes::random(32);
        let b = SecureBytes::random(32);
        assert_eq!(a.len(), 32);
        // Two 256-bit randoms colliding means a broken RNG
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_render() {
        let buf = SecureBytes::from(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(buf.to_hex(), "deadbeef");
        assert_eq!(format!("{}", buf), "deadbeef");
    }
}
