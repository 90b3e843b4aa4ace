//! The authenticated box used for every encrypted protocol message.
//!
//! Construction: X25519 Diffie-Hellman with the peer → HKDF-SHA256 key
//! derivation (fixed info string) → XChaCha20-Poly1305 AEAD under a 24-byte
//! nonce. The derivation is symmetric, so both endpoints of a connection
//! arrive at the same per-peer key and the nonce discipline alone separates
//! the two directions.
//!
//! The trait exists so tests can substitute a deterministic implementation
//! and so the backend can be swapped without touching the protocol engine.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::Error;
use crate::secret::{Nonce, Protection, SecretBuffer, NONCE_SIZE};

const BOX_INFO: &[u8] = b"kpxc-client-box-v1";

/// Abstract crypto provider: session keypair, random material, and the
/// per-peer authenticated box.
pub trait Cryptor: Send {
    /// Generate a fresh ephemeral session keypair, replacing any prior one.
    fn create_keys(&mut self) -> Result<(), Error>;

    /// The session public key, empty until [`Cryptor::create_keys`] ran.
    fn public_key(&self) -> SecretBuffer;

    /// A fresh random 24-byte nonce.
    fn generate_random_nonce(&self, protection: Protection) -> Nonce;

    /// `len` fresh random secret bytes.
    fn generate_random(&self, len: usize, protection: Protection) -> SecretBuffer;

    /// Seal `plain` for `peer_public` under `nonce`. Never partial.
    fn encrypt(
        &self,
        plain: &[u8],
        peer_public: &SecretBuffer,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, Error>;

    /// Open `cipher` from `peer_public` under `nonce`. Fails closed on any
    /// authentication-tag mismatch.
    fn decrypt(
        &self,
        cipher: &[u8],
        peer_public: &SecretBuffer,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, Error>;

    /// Zeroize and release the session keypair.
    fn drop_keys(&mut self);
}

/// Default [`Cryptor`] backend.
pub struct BoxCryptor {
    secret: Option<StaticSecret>,
    public: SecretBuffer,
}

impl BoxCryptor {
    pub fn new() -> Self {
        Self {
            secret: None,
            public: SecretBuffer::zeroed(0, Protection::Readable),
        }
    }

    fn session_cipher(&self, peer_public: &SecretBuffer) -> Result<XChaCha20Poly1305, Error> {
        let secret = self.secret.as_ref().ok_or(Error::CannotEncryptMessage)?;
        let peer_bytes: [u8; 32] = peer_public
            .bytes()
            .try_into()
            .map_err(|_| Error::CannotEncryptMessage)?;
        let shared = secret.diffie_hellman(&PublicKey::from(peer_bytes));

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(BOX_INFO, &mut okm)
            .map_err(|_| Error::CannotEncryptMessage)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&okm));
        okm.zeroize();
        Ok(cipher)
    }
}

impl Default for BoxCryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Cryptor for BoxCryptor {
    fn create_keys(&mut self) -> Result<(), Error> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        self.secret = Some(secret);
        self.public =
            SecretBuffer::from_bytes(public.as_bytes().to_vec(), Protection::Readonly);
        Ok(())
    }

    fn public_key(&self) -> SecretBuffer {
        self.public.clone()
    }

    fn generate_random_nonce(&self, protection: Protection) -> Nonce {
        self.generate_random(NONCE_SIZE, protection)
    }

    fn generate_random(&self, len: usize, protection: Protection) -> SecretBuffer {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        SecretBuffer::from_bytes(bytes, protection)
    }

    fn encrypt(
        &self,
        plain: &[u8],
        peer_public: &SecretBuffer,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, Error> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::CannotEncryptMessage);
        }
        self.session_cipher(peer_public)?
            .encrypt(XNonce::from_slice(nonce.bytes()), plain)
            .map_err(|_| Error::CannotEncryptMessage)
    }

    fn decrypt(
        &self,
        cipher: &[u8],
        peer_public: &SecretBuffer,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, Error> {
        if nonce.len() != NONCE_SIZE || self.secret.is_none() {
            return Err(Error::CannotDecryptMessage);
        }
        self.session_cipher(peer_public)
            .map_err(|_| Error::CannotDecryptMessage)?
            .decrypt(XNonce::from_slice(nonce.bytes()), cipher)
            .map_err(|_| Error::CannotDecryptMessage)
    }

    fn drop_keys(&mut self) {
        // StaticSecret zeroizes on drop.
        self.secret = None;
        self.public.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (BoxCryptor, BoxCryptor) {
        let mut a = BoxCryptor::new();
        let mut b = BoxCryptor::new();
        a.create_keys().unwrap();
        b.create_keys().unwrap();
        (a, b)
    }

    #[test]
    fn box_round_trips() {
        let (a, b) = pair();
        let nonce = a.generate_random_nonce(Protection::Readable);
        let cipher = a.encrypt(b"attack at dawn", &b.public_key(), &nonce).unwrap();
        let plain = b.decrypt(&cipher, &a.public_key(), &nonce).unwrap();
        assert_eq!(plain, b"attack at dawn");
    }

    #[test]
    fn corrupted_cipher_fails_closed() {
        let (a, b) = pair();
        let nonce = a.generate_random_nonce(Protection::Readable);
        let mut cipher = a.encrypt(b"payload", &b.public_key(), &nonce).unwrap();
        for i in 0..cipher.len() {
            cipher[i] ^= 0x01;
            assert_eq!(
                b.decrypt(&cipher, &a.public_key(), &nonce),
                Err(Error::CannotDecryptMessage)
            );
            cipher[i] ^= 0x01;
        }
    }

    #[test]
    fn wrong_nonce_fails_closed() {
        let (a, b) = pair();
        let nonce = a.generate_random_nonce(Protection::Readable);
        let cipher = a.encrypt(b"payload", &b.public_key(), &nonce).unwrap();
        let mut other = nonce.clone();
        other.increment();
        assert_eq!(
            b.decrypt(&cipher, &a.public_key(), &other),
            Err(Error::CannotDecryptMessage)
        );
    }

    #[test]
    fn wrong_peer_fails_closed() {
        let (a, b) = pair();
        let mut c = BoxCryptor::new();
        c.create_keys().unwrap();
        let nonce = a.generate_random_nonce(Protection::Readable);
        let cipher = a.encrypt(b"payload", &b.public_key(), &nonce).unwrap();
        assert_eq!(
            b.decrypt(&cipher, &c.public_key(), &nonce),
            Err(Error::CannotDecryptMessage)
        );
    }

    #[test]
    fn encrypt_without_keys_is_refused() {
        let cryptor = BoxCryptor::new();
        let peer = SecretBuffer::from_bytes(vec![1u8; 32], Protection::Readonly);
        let nonce = cryptor.generate_random_nonce(Protection::Readable);
        assert_eq!(
            cryptor.encrypt(b"x", &peer, &nonce),
            Err(Error::CannotEncryptMessage)
        );
    }

    #[test]
    fn drop_keys_releases_public_key() {
        let (mut a, _) = pair();
        assert_eq!(a.public_key().len(), 32);
        a.drop_keys();
        assert!(a.public_key().is_empty());
    }
}
