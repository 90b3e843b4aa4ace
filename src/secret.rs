//! Owned secret byte buffers with explicit zeroization.
//!
//! [`SecretBuffer`] is the container for every piece of key material the
//! client holds: session keys, the server public key, the client ID and the
//! nonces in flight. Bytes are wiped on drop (and on [`SecretBuffer::clear`]).
//! The protection state is an access discipline enforced by this type, not
//! page-level memory protection — accessing a `NoAccess` buffer panics.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::Error;

/// Nonce length of the authenticated box (XChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 24;

/// Access permission currently applied to a [`SecretBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Readable and writable.
    Readable,
    /// Readable, mutation refused.
    Readonly,
    /// Any access refused until promoted back.
    NoAccess,
}

/// A 24-byte [`SecretBuffer`] used exactly once per encryption direction.
pub type Nonce = SecretBuffer;

/// Fixed-capacity secret byte container.
pub struct SecretBuffer {
    bytes: Vec<u8>,
    protection: Protection,
}

impl SecretBuffer {
    /// A zero-filled buffer of `len` bytes in the given protection state.
    pub fn zeroed(len: usize, protection: Protection) -> Self {
        Self {
            bytes: vec![0u8; len],
            protection,
        }
    }

    /// Take ownership of `bytes` as secret material.
    pub fn from_bytes(bytes: Vec<u8>, protection: Protection) -> Self {
        Self { bytes, protection }
    }

    /// Decode a base64 wire field into a secret buffer.
    pub fn from_base64(encoded: &str, protection: Protection) -> Result<Self, Error> {
        let bytes = BASE64.decode(encoded).map_err(|_| Error::JsonParseError)?;
        Ok(Self { bytes, protection })
    }

    /// Encode for a wire field. Panics if the buffer is `NoAccess`.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes())
    }

    /// Borrow the secret bytes. Panics if the buffer is `NoAccess`.
    pub fn bytes(&self) -> &[u8] {
        assert!(
            self.protection != Protection::NoAccess,
            "secret buffer accessed while NoAccess"
        );
        &self.bytes
    }

    /// Mutably borrow the secret bytes. Panics unless the buffer is `Readable`.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        assert!(
            self.protection == Protection::Readable,
            "secret buffer mutated while not Readable"
        );
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn make_readable(&mut self) {
        self.protection = Protection::Readable;
    }

    pub fn make_readonly(&mut self) {
        self.protection = Protection::Readonly;
    }

    pub fn make_no_access(&mut self) {
        self.protection = Protection::NoAccess;
    }

    /// Interpret the bytes as a little-endian integer and add one, wrapping.
    ///
    /// This is the reply-nonce rule: the expected reply to a request sent
    /// under nonce `N` arrives under `increment(N)`.
    pub fn increment(&mut self) {
        let mut carry = 1u16;
        for b in self.bytes_mut() {
            let sum = u16::from(*b) + carry;
            *b = sum as u8;
            carry = sum >> 8;
        }
    }

    /// Zeroize and release the contents. The buffer becomes empty and
    /// `Readable` again.
    pub fn clear(&mut self) {
        self.bytes.zeroize();
        self.bytes = Vec::new();
        self.protection = Protection::Readable;
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl Clone for SecretBuffer {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            protection: self.protection,
        }
    }
}

/// Constant-time equality over the raw bytes. Length is not considered
/// secret; buffers of different lengths compare unequal immediately.
impl PartialEq for SecretBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for SecretBuffer {}

impl std::fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBuffer({} bytes, {:?})", self.bytes.len(), self.protection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips() {
        let buf = SecretBuffer::from_bytes(vec![0, 1, 2, 0xFE, 0xFF], Protection::Readable);
        let decoded = SecretBuffer::from_base64(&buf.to_base64(), Protection::Readable).unwrap();
        assert_eq!(buf, decoded);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(SecretBuffer::from_base64("!!not base64!!", Protection::Readable).is_err());
    }

    #[test]
    fn increment_carries_little_endian() {
        let mut buf = SecretBuffer::from_bytes(vec![0xFF, 0x00, 0x05], Protection::Readable);
        buf.increment();
        assert_eq!(buf.bytes(), &[0x00, 0x01, 0x05]);
    }

    #[test]
    fn increment_wraps_at_capacity() {
        let mut buf = SecretBuffer::from_bytes(vec![0xFF; 4], Protection::Readable);
        buf.increment();
        assert_eq!(buf.bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn increment_matches_integer_addition() {
        // 2^20 single steps == one addition of 2^20 mod 2^32 on a 4-byte buffer.
        let start = 0xFFFF_FF00u32;
        let mut buf = SecretBuffer::from_bytes(start.to_le_bytes().to_vec(), Protection::Readable);
        for _ in 0..(1u32 << 20) {
            buf.increment();
        }
        let expected = start.wrapping_add(1 << 20).to_le_bytes();
        assert_eq!(buf.bytes(), &expected);
    }

    #[test]
    fn equality_is_by_content() {
        let a = SecretBuffer::from_bytes(vec![1, 2, 3], Protection::Readable);
        let b = SecretBuffer::from_bytes(vec![1, 2, 3], Protection::Readonly);
        let c = SecretBuffer::from_bytes(vec![1, 2, 4], Protection::Readable);
        let short = SecretBuffer::from_bytes(vec![1, 2], Protection::Readable);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, short);
    }

    #[test]
    #[should_panic(expected = "NoAccess")]
    fn no_access_refuses_reads() {
        let mut buf = SecretBuffer::zeroed(8, Protection::Readable);
        buf.make_no_access();
        let _ = buf.bytes();
    }

    #[test]
    #[should_panic(expected = "not Readable")]
    fn readonly_refuses_mutation() {
        let mut buf = SecretBuffer::zeroed(8, Protection::Readonly);
        buf.increment();
    }

    #[test]
    fn clear_releases_contents() {
        let mut buf = SecretBuffer::from_bytes(vec![7; 16], Protection::Readonly);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.protection(), Protection::Readable);
    }
}
