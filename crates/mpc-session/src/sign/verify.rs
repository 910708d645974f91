//! Signature verification

use crate::engine::KeyshareHandle;
use crate::types::KeyType;
use crate::{Error, Result};
use ed25519_dalek::Verifier;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use tracing::{debug, error};

/// Check an engine signature against the keyshare's public key.
///
/// ECDSA signatures are checked against the child key at `chain_path`, EdDSA
/// signatures against the root key. The outcome is logged; a failed check
/// does not fail the signing operation.
pub fn verify_signature(
    key_type: KeyType,
    keyshare: &KeyshareHandle,
    chain_path: &str,
    message: &[u8],
    signature: &[u8],
) -> bool {
    match check(key_type, keyshare, chain_path, message, signature) {
        Ok(()) => {
            debug!(%key_type, "Signature verified");
            true
        }
        Err(e) => {
            error!(%key_type, error = %e, "Signature verification failed");
            false
        }
    }
}

fn check(
    key_type: KeyType,
    keyshare: &KeyshareHandle,
    chain_path: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    match key_type {
        KeyType::Ecdsa => {
            let child = keyshare.derive_child_public_key(chain_path)?;
            let verifying_key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&child)
                .map_err(|e| Error::Engine(format!("Invalid public key: {}", e)))?;
            let signature = k256::ecdsa::Signature::from_slice(signature.get(..64).unwrap_or(signature))
                .map_err(|e| Error::Engine(format!("Invalid signature: {}", e)))?;
            verifying_key
                .verify_prehash(message, &signature)
                .map_err(|e| Error::Engine(format!("ECDSA verification: {}", e)))
        }
        KeyType::Eddsa => {
            let public_key: [u8; 32] = keyshare
                .public_key()?
                .try_into()
                .map_err(|_| Error::Engine("EdDSA public key must be 32 bytes".into()))?;
            let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public_key)
                .map_err(|e| Error::Engine(format!("Invalid public key: {}", e)))?;
            let signature = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|e| Error::Engine(format!("Invalid signature: {}", e)))?;
            verifying_key
                .verify(message, &signature)
                .map_err(|e| Error::Engine(format!("EdDSA verification: {}", e)))
        }
    }
}
