//! Transport encryption for protocol payloads
//!
//! Every party of a session derives the same AES-256-GCM key from the hex
//! key distributed out of band. Sealed payloads are
//! `base64(nonce || ciphertext)` where the plaintext is itself the base64 of
//! the raw engine bytes.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// Per-session transport codec
#[derive(Clone)]
pub struct TransportCodec {
    key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for TransportCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCodec").finish_non_exhaustive()
    }
}

impl TransportCodec {
    /// Derive the codec from the session's hex encryption key
    pub fn from_hex_key(hex_key: &str) -> Result<Self> {
        let raw = Zeroizing::new(
            hex::decode(hex_key)
                .map_err(|e| Error::InvalidInput(format!("encryption key is not hex: {}", e)))?,
        );
        if raw.is_empty() {
            return Err(Error::InvalidInput("encryption key is empty".into()));
        }

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&Sha256::digest(raw.as_slice()));
        Ok(Self { key })
    }

    /// Encrypt with a fresh random nonce, returning `nonce || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|e| Error::Codec(format!("Failed to create cipher: {}", e)))?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| Error::Codec(format!("Encryption failed: {}", e)))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt `nonce || ciphertext`
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Codec("Ciphertext too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|e| Error::Codec(format!("Failed to create cipher: {}", e)))?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Codec(format!("Decryption failed: {}", e)))
    }

    /// Encode and encrypt raw engine bytes into a relay body
    pub fn seal(&self, raw: &[u8]) -> Result<String> {
        let inner = STANDARD.encode(raw);
        let sealed = self.encrypt(inner.as_bytes())?;
        Ok(STANDARD.encode(sealed))
    }

    /// Inverse of [`TransportCodec::seal`]
    pub fn open(&self, body: &str) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(body)
            .map_err(|e| Error::Codec(format!("body is not base64: {}", e)))?;
        let inner = self.decrypt(&sealed)?;
        STANDARD
            .decode(&inner)
            .map_err(|e| Error::Codec(format!("payload is not base64: {}", e)))
    }
}

/// Dedup digest of a relay body
pub fn content_hash(body: &str) -> String {
    msg_relay::digest(body.as_bytes())
}

/// Relay tag for a message being signed
pub fn message_id(message: &str) -> String {
    msg_relay::digest(message.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let codec = TransportCodec::from_hex_key("a1b2c3").unwrap();
        let body = codec.seal(b"round one").unwrap();

        assert_eq!(codec.open(&body).unwrap(), b"round one");
        // fresh nonce every time
        assert_ne!(codec.seal(b"round one").unwrap(), body);
    }

    #[test]
    fn test_wrong_key_fails() {
        let codec = TransportCodec::from_hex_key("a1b2c3").unwrap();
        let other = TransportCodec::from_hex_key("a1b2c4").unwrap();
        let body = codec.seal(b"secret").unwrap();

        assert!(matches!(other.open(&body), Err(Error::Codec(_))));
    }

    #[test]
    fn test_garbage_fails() {
        let codec = TransportCodec::from_hex_key("00").unwrap();

        assert!(codec.open("!!!").is_err());
        assert!(codec.open(&STANDARD.encode([1u8; 4])).is_err());
        assert!(codec.decrypt(&[0u8; 40]).is_err());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            TransportCodec::from_hex_key("zz"),
            Err(Error::InvalidInput(_))
        ));
        assert!(TransportCodec::from_hex_key("").is_err());
    }

    #[test]
    fn test_hashes() {
        assert_eq!(content_hash("abc"), msg_relay::digest(b"abc"));
        assert_eq!(message_id("deadbeef"), message_id("deadbeef"));
        assert_ne!(message_id("deadbeef"), message_id("deadbeee"));
    }
}
