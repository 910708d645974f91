//! Distributed Signature Generation
//!
//! Signs message digests with a stored keyshare. Every message runs in its
//! own setup exchange under a tag derived from the message, and the setup is
//! checked to commit to that message before a signing session is created.

mod dsg;
mod verify;

pub use dsg::run_keysign;
pub use verify::verify_signature;

use crate::types::{KeyType, KeysignResponse};
use crate::{Error, Result};

const ECDSA_SIGNATURE_LEN: usize = 65;
const EDDSA_SIGNATURE_LEN: usize = 64;

/// Split an engine signature into the response fields.
///
/// ECDSA signatures are `r || s || v`; DER and recovery id are ECDSA only.
pub fn signature_response(key_type: KeyType, message: &str, signature: &[u8]) -> Result<KeysignResponse> {
    match key_type {
        KeyType::Ecdsa => {
            if signature.len() != ECDSA_SIGNATURE_LEN {
                return Err(Error::Engine(format!(
                    "ECDSA signature must be {} bytes, got {}",
                    ECDSA_SIGNATURE_LEN,
                    signature.len()
                )));
            }
            let der = k256::ecdsa::Signature::from_slice(&signature[..64])
                .map_err(|e| Error::Engine(format!("Invalid signature: {}", e)))?
                .to_der();
            Ok(KeysignResponse {
                msg: message.to_string(),
                r: hex::encode(&signature[..32]),
                s: hex::encode(&signature[32..64]),
                der_signature: hex::encode(der.as_bytes()),
                recovery_id: hex::encode(&signature[64..]),
            })
        }
        KeyType::Eddsa => {
            if signature.len() != EDDSA_SIGNATURE_LEN {
                return Err(Error::Engine(format!(
                    "EdDSA signature must be {} bytes, got {}",
                    EDDSA_SIGNATURE_LEN,
                    signature.len()
                )));
            }
            Ok(KeysignResponse {
                msg: message.to_string(),
                r: hex::encode(&signature[..32]),
                s: hex::encode(&signature[32..]),
                der_signature: String::new(),
                recovery_id: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{Signature, SigningKey};
    use rand::rngs::OsRng;

    #[test]
    fn test_ecdsa_response() {
        let key = SigningKey::random(&mut OsRng);
        let hash = [7u8; 32];
        let (signature, recovery_id) = key.sign_prehash_recoverable(&hash).unwrap();
        let mut raw = signature.to_bytes().to_vec();
        raw.push(recovery_id.to_byte());

        let response = signature_response(KeyType::Ecdsa, "0707", &raw).unwrap();
        assert_eq!(response.msg, "0707");
        assert_eq!(response.r.len(), 64);
        assert_eq!(response.s.len(), 64);
        assert_eq!(response.recovery_id, hex::encode([recovery_id.to_byte()]));
        let der = hex::decode(&response.der_signature).unwrap();
        assert_eq!(Signature::from_der(&der).unwrap(), signature);
    }

    #[test]
    fn test_ecdsa_length_enforced() {
        let err = signature_response(KeyType::Ecdsa, "00", &[1u8; 64]).unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[test]
    fn test_eddsa_response_has_no_der() {
        let response = signature_response(KeyType::Eddsa, "00", &[3u8; 64]).unwrap();
        assert_eq!(response.r, hex::encode([3u8; 32]));
        assert!(response.der_signature.is_empty());
        assert!(response.recovery_id.is_empty());
    }
}
