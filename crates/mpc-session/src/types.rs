//! Request, response and vault types

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a party in the MPC network
pub type PartyId = String;

/// Caller supplied session identifier
pub type SessionId = String;

/// Setup tag used for EdDSA payloads and mailboxes within a shared session
pub const EDDSA_TAG: &str = "eddsa";

/// Signature scheme a keyshare belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ecdsa,
    Eddsa,
}

impl KeyType {
    /// Relay tag separating this key type's setup payload and messages
    pub fn setup_tag(&self) -> &'static str {
        match self {
            KeyType::Ecdsa => "",
            KeyType::Eddsa => EDDSA_TAG,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ecdsa => write!(f, "ecdsa"),
            KeyType::Eddsa => write!(f, "eddsa"),
        }
    }
}

/// Number of parties required to sign for a committee of `n`.
///
/// Two thirds of the committee, rounded up.
pub fn signing_threshold(n: usize) -> usize {
    (2 * n + 2) / 3
}

/// Committee encoding expected by the engine: IDs separated by a zero byte
pub fn committee_bytes(parties: &[String]) -> Vec<u8> {
    parties.join("\0").into_bytes()
}

/// Positions of `subset` members inside `committee`, as engine party indices
pub fn party_indices(committee: &[String], subset: &[String]) -> Result<Vec<u8>> {
    subset
        .iter()
        .map(|party| {
            committee
                .iter()
                .position(|p| p == party)
                .and_then(|i| u8::try_from(i).ok())
                .ok_or_else(|| Error::InvalidInput(format!("party {} not in committee", party)))
        })
        .collect()
}

/// Old signers that are also members of the new committee, in old-signer order
pub fn old_parties(old_signers: &[String], new_committee: &[String]) -> Vec<String> {
    old_signers
        .iter()
        .filter(|p| new_committee.contains(p))
        .cloned()
        .collect()
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} is required", field)));
    }
    Ok(())
}

fn require_hex(value: &str, field: &str) -> Result<()> {
    require(value, field)?;
    hex::decode(value).map_err(|e| Error::InvalidInput(format!("{} is not hex: {}", field, e)))?;
    Ok(())
}

fn require_committee(parties: &[String], local_party_id: &str) -> Result<()> {
    require(local_party_id, "local_party_id")?;
    if parties.is_empty() {
        return Err(Error::InvalidInput("committee is empty".into()));
    }
    if !parties.iter().any(|p| p == local_party_id) {
        return Err(Error::InvalidInput(format!(
            "local party {} is not in the committee",
            local_party_id
        )));
    }
    Ok(())
}

/// Request to generate a new vault
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenRequest {
    pub name: String,
    pub session_id: SessionId,
    pub hex_encryption_key: String,
    pub local_party_id: PartyId,
    pub parties: Vec<PartyId>,
    pub is_initiate_device: bool,
}

impl KeygenRequest {
    pub fn validate(&self) -> Result<()> {
        require(&self.session_id, "session_id")?;
        require_hex(&self.hex_encryption_key, "hex_encryption_key")?;
        require_committee(&self.parties, &self.local_party_id)
    }
}

/// Request to sign one or more message digests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignRequest {
    /// Root public key of the keyshare to sign with (hex)
    pub public_key: String,
    /// Hex encoded digests to sign
    pub messages: Vec<String>,
    pub session_id: SessionId,
    pub hex_encryption_key: String,
    /// BIP32 path; hardened markers are ignored
    pub derive_path: String,
    pub key_type: KeyType,
    pub local_party_id: PartyId,
    pub parties: Vec<PartyId>,
    pub is_initiate_device: bool,
}

impl KeysignRequest {
    pub fn validate(&self) -> Result<()> {
        require_hex(&self.public_key, "public_key")?;
        require(&self.session_id, "session_id")?;
        require_hex(&self.hex_encryption_key, "hex_encryption_key")?;
        require(&self.derive_path, "derive_path")?;
        if self.messages.is_empty() {
            return Err(Error::InvalidInput("messages are required".into()));
        }
        for message in &self.messages {
            require_hex(message, "message")?;
        }
        require_committee(&self.parties, &self.local_party_id)
    }

    /// Derive path with hardened markers stripped
    pub fn chain_path(&self) -> String {
        self.derive_path.replace('\'', "")
    }
}

/// Signature over one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub msg: String,
    pub r: String,
    pub s: String,
    pub der_signature: String,
    pub recovery_id: String,
}

/// Request to move a vault to a new committee
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshareRequest {
    pub name: String,
    pub public_key_ecdsa: String,
    pub public_key_eddsa: String,
    pub hex_chain_code: String,
    pub session_id: SessionId,
    pub hex_encryption_key: String,
    pub local_party_id: PartyId,
    /// Signers of the current vault
    pub old_parties: Vec<PartyId>,
    /// New committee
    pub parties: Vec<PartyId>,
    pub is_initiate_device: bool,
}

impl ReshareRequest {
    pub fn validate(&self) -> Result<()> {
        require_hex(&self.public_key_ecdsa, "public_key_ecdsa")?;
        require_hex(&self.public_key_eddsa, "public_key_eddsa")?;
        require(&self.session_id, "session_id")?;
        require_hex(&self.hex_encryption_key, "hex_encryption_key")?;
        if self.old_parties.is_empty() {
            return Err(Error::InvalidInput("old_parties are required".into()));
        }
        require_committee(&self.parties, &self.local_party_id)
    }

    /// Whether the local party holds a keyshare of the current vault
    pub fn is_old_signer(&self) -> bool {
        self.old_parties.contains(&self.local_party_id)
    }
}

/// Request to convert legacy secret shares into engine keyshares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateRequest {
    pub name: String,
    pub public_key_ecdsa: String,
    pub public_key_eddsa: String,
    pub hex_chain_code: String,
    /// Legacy ECDSA secret share (hex)
    pub ecdsa_share: String,
    /// Legacy EdDSA secret share (hex)
    pub eddsa_share: String,
    pub session_id: SessionId,
    pub hex_encryption_key: String,
    pub local_party_id: PartyId,
    pub parties: Vec<PartyId>,
    pub is_initiate_device: bool,
}

impl MigrateRequest {
    pub fn validate(&self) -> Result<()> {
        require_hex(&self.public_key_ecdsa, "public_key_ecdsa")?;
        require_hex(&self.public_key_eddsa, "public_key_eddsa")?;
        require_hex(&self.hex_chain_code, "hex_chain_code")?;
        require(&self.ecdsa_share, "ecdsa_share")?;
        require(&self.eddsa_share, "eddsa_share")?;
        require(&self.session_id, "session_id")?;
        require_hex(&self.hex_encryption_key, "hex_encryption_key")?;
        require_committee(&self.parties, &self.local_party_id)
    }

    /// Public key and legacy share for a key type
    pub fn material(&self, key_type: KeyType) -> (&str, &str) {
        match key_type {
            KeyType::Ecdsa => (&self.public_key_ecdsa, &self.ecdsa_share),
            KeyType::Eddsa => (&self.public_key_eddsa, &self.eddsa_share),
        }
    }
}

/// Right-pad a legacy hex secret share with zeros to 32 bytes of hex
pub fn pad_legacy_share(share: &str) -> String {
    format!("{:0<64}", share)
}

/// Keyshare persisted for one public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyshareRecord {
    pub public_key: String,
    /// Base64 engine keyshare bytes
    pub keyshare: String,
}

/// Result of keygen, reshare and migrate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRecord {
    pub name: String,
    pub local_party_id: PartyId,
    pub public_key_ecdsa: String,
    pub public_key_eddsa: String,
    pub hex_chain_code: String,
    pub signers: Vec<PartyId>,
    pub keyshares: Vec<KeyshareRecord>,
    pub reshare_prefix: String,
    pub created_at: DateTime<Utc>,
}

/// What finalizing one key type produced
#[derive(Debug, Clone)]
pub struct KeyOutcome {
    pub key_type: KeyType,
    pub public_key: String,
    pub keyshare: String,
    /// ECDSA only
    pub chain_code: Option<String>,
}

impl VaultRecord {
    pub(crate) fn from_outcomes(
        name: &str,
        local_party_id: &str,
        signers: Vec<PartyId>,
        ecdsa: KeyOutcome,
        eddsa: KeyOutcome,
        fallback_chain_code: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            local_party_id: local_party_id.to_string(),
            public_key_ecdsa: ecdsa.public_key.clone(),
            public_key_eddsa: eddsa.public_key.clone(),
            hex_chain_code: ecdsa
                .chain_code
                .clone()
                .unwrap_or_else(|| fallback_chain_code.to_string()),
            signers,
            keyshares: vec![
                KeyshareRecord {
                    public_key: ecdsa.public_key,
                    keyshare: ecdsa.keyshare,
                },
                KeyshareRecord {
                    public_key: eddsa.public_key,
                    keyshare: eddsa.keyshare,
                },
            ],
            reshare_prefix: String::new(),
            created_at: Utc::now(),
        }
    }
}
