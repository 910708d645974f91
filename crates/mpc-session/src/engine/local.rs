//! In-process engine simulator
//!
//! Runs every protocol as one message round over additive (ECDSA) or XOR
//! (EdDSA) sharings of the key. Shares travel in the clear inside engine
//! messages, so this is only fit for tests and local development. All
//! share holders must take part in signing and resharing.

use super::{Handle, RawOutput, SessionFamily, SigningScheme};
use crate::types::KeyType;
use crate::{Error, Result};
use dashmap::DashMap;
use derivation_path::{ChildIndex, DerivationPath};
use ed25519_dalek::Signer;
use hmac::{Hmac, Mac};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce, sec1::ToEncodedPoint, Field},
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use tracing::debug;

type Share = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum SetupKind {
    Keygen,
    Sign,
    Reshare,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetupPayload {
    kind: SetupKind,
    key_type: KeyType,
    nonce: String,
    parties: Vec<String>,
    threshold: usize,
    key_id: Option<String>,
    message_hash: Option<String>,
    chain_path: Option<String>,
    old_parties: Vec<String>,
}

/// Serialized keyshare
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimKeyshare {
    key_type: KeyType,
    party_id: String,
    holders: Vec<String>,
    threshold: usize,
    share: String,
    public_key: String,
    chain_code: String,
}

impl SimKeyshare {
    fn share(&self) -> Result<Share> {
        decode_share(&self.share)
    }

    fn key_id(&self) -> Result<Vec<u8>> {
        let public_key = hex::decode(&self.public_key)?;
        Ok(Sha256::digest(&public_key).to_vec())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimMessage {
    nonce: String,
    from: String,
    to: Vec<String>,
    value: String,
    #[serde(default)]
    chain: String,
    #[serde(default)]
    public_key: String,
}

enum Outcome {
    Keyshare(SimKeyshare),
    Signature(Vec<u8>),
}

/// Key material a migration starts from
struct Migration {
    public_key: Vec<u8>,
    chain_code: Vec<u8>,
}

struct SimSession {
    family: SessionFamily,
    setup: SetupPayload,
    party_id: String,
    outbox: VecDeque<Vec<u8>>,
    expected: Vec<String>,
    received: BTreeMap<String, SimMessage>,
    own_share: Share,
    own_chain: Vec<u8>,
    keyshare: Option<SimKeyshare>,
    migration: Option<Migration>,
    outcome: Option<Outcome>,
}

/// Simulated engine for one key type
pub struct LocalEngine {
    key_type: KeyType,
    next_handle: AtomicI32,
    sessions: DashMap<i32, SimSession>,
    keyshares: DashMap<i32, SimKeyshare>,
    fail_sessions: AtomicBool,
    session_attempts: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_freed: AtomicUsize,
    keyshares_created: AtomicUsize,
    keyshares_freed: AtomicUsize,
}

impl LocalEngine {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            next_handle: AtomicI32::new(1),
            sessions: DashMap::new(),
            keyshares: DashMap::new(),
            fail_sessions: AtomicBool::new(false),
            session_attempts: AtomicUsize::new(0),
            sessions_created: AtomicUsize::new(0),
            sessions_freed: AtomicUsize::new(0),
            keyshares_created: AtomicUsize::new(0),
            keyshares_freed: AtomicUsize::new(0),
        }
    }

    /// Make every session constructor fail
    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    /// Calls to any session constructor, failed or not
    pub fn session_attempts(&self) -> usize {
        self.session_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_freed(&self) -> usize {
        self.sessions_freed.load(Ordering::SeqCst)
    }

    pub fn keyshares_created(&self) -> usize {
        self.keyshares_created.load(Ordering::SeqCst)
    }

    pub fn keyshares_freed(&self) -> usize {
        self.keyshares_freed.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn live_keyshares(&self) -> usize {
        self.keyshares.len()
    }

    /// Trusted dealer: serialized keyshares of a fresh key for `parties`
    pub fn deal(key_type: KeyType, parties: &[String]) -> Result<Vec<Vec<u8>>> {
        let secret = random_share(key_type);
        let pieces = split(key_type, &secret, parties.len());
        let public_key = hex::encode(public_key_of(key_type, &secret)?);
        let chain_code = match key_type {
            KeyType::Ecdsa => hex::encode(rand::random::<[u8; 32]>()),
            KeyType::Eddsa => String::new(),
        };

        parties
            .iter()
            .zip(pieces)
            .map(|(party, piece)| -> Result<Vec<u8>> {
                let keyshare = SimKeyshare {
                    key_type,
                    party_id: party.clone(),
                    holders: parties.to_vec(),
                    threshold: parties.len(),
                    share: hex::encode(piece),
                    public_key: public_key.clone(),
                    chain_code: chain_code.clone(),
                };
                Ok(serde_json::to_vec(&keyshare)?)
            })
            .collect()
    }

    /// Legacy secret shares of a fresh key: `(public_key, hex shares)`
    pub fn deal_legacy(key_type: KeyType, n: usize) -> Result<(Vec<u8>, Vec<String>)> {
        let secret = random_share(key_type);
        let pieces = split(key_type, &secret, n);
        Ok((
            public_key_of(key_type, &secret)?,
            pieces.iter().map(hex::encode).collect(),
        ))
    }

    fn allocate(&self) -> Handle {
        Handle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn insert_keyshare(&self, keyshare: SimKeyshare) -> Handle {
        let handle = self.allocate();
        self.keyshares.insert(handle.0, keyshare);
        self.keyshares_created.fetch_add(1, Ordering::SeqCst);
        handle
    }

    fn keyshare(&self, handle: Handle) -> Result<SimKeyshare> {
        self.keyshares
            .get(&handle.0)
            .map(|k| k.value().clone())
            .ok_or_else(|| Error::Engine(format!("unknown keyshare handle {}", handle.0)))
    }

    fn check_session_creation(&self) -> Result<()> {
        self.session_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(Error::Engine("injected session failure".into()));
        }
        Ok(())
    }

    fn decode_setup(&self, setup: &[u8], kind: SetupKind) -> Result<SetupPayload> {
        let payload: SetupPayload = serde_json::from_slice(setup)
            .map_err(|e| Error::Engine(format!("invalid setup message: {}", e)))?;
        if payload.kind != kind || payload.key_type != self.key_type {
            return Err(Error::Engine(format!(
                "setup is a {:?}/{} setup, expected {:?}/{}",
                payload.kind, payload.key_type, kind, self.key_type
            )));
        }
        Ok(payload)
    }

    fn new_setup(&self, kind: SetupKind, ids: &[u8], threshold: usize) -> Result<SetupPayload> {
        let parties = parse_ids(ids)?;
        Ok(SetupPayload {
            kind,
            key_type: self.key_type,
            nonce: hex::encode(rand::random::<[u8; 16]>()),
            parties,
            threshold,
            key_id: None,
            message_hash: None,
            chain_path: None,
            old_parties: Vec::new(),
        })
    }

    /// Register a session that broadcasts `value` to every other committee member
    #[allow(clippy::too_many_arguments)]
    fn open_broadcast(
        &self,
        family: SessionFamily,
        setup: SetupPayload,
        party_id: &str,
        own_share: Share,
        value: String,
        own_chain: Vec<u8>,
        expected: Vec<String>,
        keyshare: Option<SimKeyshare>,
        migration: Option<Migration>,
    ) -> Result<Handle> {
        if !setup.parties.iter().any(|p| p == party_id) {
            return Err(Error::Engine(format!("{} is not in the setup committee", party_id)));
        }
        let others: Vec<String> = setup
            .parties
            .iter()
            .filter(|p| p.as_str() != party_id)
            .cloned()
            .collect();
        let message = SimMessage {
            nonce: setup.nonce.clone(),
            from: party_id.to_string(),
            to: others,
            value,
            chain: hex::encode(&own_chain),
            public_key: String::new(),
        };

        let mut outbox = VecDeque::new();
        outbox.push_back(serde_json::to_vec(&message)?);
        Ok(self.register(SimSession {
            family,
            setup,
            party_id: party_id.to_string(),
            outbox,
            expected,
            received: BTreeMap::new(),
            own_share,
            own_chain,
            keyshare,
            migration,
            outcome: None,
        }))
    }

    fn register(&self, session: SimSession) -> Handle {
        let handle = self.allocate();
        debug!(handle = handle.0, party = %session.party_id, family = ?session.family, "Local session created");
        self.sessions.insert(handle.0, session);
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        handle
    }

    fn complete(&self, session: &SimSession) -> Result<Outcome> {
        let key_type = self.key_type;
        match (session.family, session.setup.kind) {
            (SessionFamily::Keygen, _) => {
                let mut values = vec![public_value(key_type, &session.own_share)?];
                let mut chains = BTreeMap::new();
                chains.insert(session.party_id.clone(), session.own_chain.clone());
                for (from, message) in &session.received {
                    values.push(hex::decode(&message.value)?);
                    chains.insert(from.clone(), hex::decode(&message.chain)?);
                }
                let public_key = combine_public(key_type, &values)?;

                let chain_code = match &session.migration {
                    Some(migration) => {
                        if migration.public_key != public_key {
                            return Err(Error::Engine(
                                "migrated shares do not add up to the public key".into(),
                            ));
                        }
                        migration.chain_code.clone()
                    }
                    None if key_type == KeyType::Ecdsa => {
                        let mut hasher = Sha256::new();
                        for party in &session.setup.parties {
                            if let Some(chain) = chains.get(party) {
                                hasher.update(chain);
                            }
                        }
                        hasher.finalize().to_vec()
                    }
                    None => Vec::new(),
                };

                Ok(Outcome::Keyshare(SimKeyshare {
                    key_type,
                    party_id: session.party_id.clone(),
                    holders: session.setup.parties.clone(),
                    threshold: session.setup.threshold,
                    share: hex::encode(session.own_share),
                    public_key: hex::encode(public_key),
                    chain_code: hex::encode(chain_code),
                }))
            }
            (SessionFamily::Sign, _) => {
                let mut secret = session.own_share;
                for message in session.received.values() {
                    secret = combine(key_type, &secret, &decode_share(&message.value)?);
                }
                let keyshare = session
                    .keyshare
                    .as_ref()
                    .ok_or_else(|| Error::Engine("sign session without keyshare".into()))?;
                let hash = hex::decode(session.setup.message_hash.as_deref().unwrap_or_default())?;
                sign(key_type, &secret, keyshare, session.setup.chain_path.as_deref(), &hash)
                    .map(Outcome::Signature)
            }
            (SessionFamily::Reshare, _) => {
                let mut share = session.own_share;
                let mut public_key = session.keyshare.as_ref().map(|k| k.public_key.clone());
                let mut chain_code = session.keyshare.as_ref().map(|k| k.chain_code.clone());
                for message in session.received.values() {
                    share = combine(key_type, &share, &decode_share(&message.value)?);
                    match &public_key {
                        Some(known) if *known != message.public_key => {
                            return Err(Error::Engine("old parties disagree on the public key".into()));
                        }
                        Some(_) => {}
                        None => public_key = Some(message.public_key.clone()),
                    }
                    chain_code.get_or_insert_with(|| message.chain.clone());
                }

                Ok(Outcome::Keyshare(SimKeyshare {
                    key_type,
                    party_id: session.party_id.clone(),
                    holders: session.setup.parties.clone(),
                    threshold: session.setup.threshold,
                    share: hex::encode(share),
                    public_key: public_key
                        .ok_or_else(|| Error::Engine("no public key received".into()))?,
                    chain_code: chain_code.unwrap_or_default(),
                }))
            }
        }
    }
}

impl SigningScheme for LocalEngine {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn keygen_setup(&self, key_id: Option<&[u8]>, threshold: usize, ids: &[u8]) -> Result<Vec<u8>> {
        let mut setup = self.new_setup(SetupKind::Keygen, ids, threshold)?;
        setup.key_id = key_id.map(hex::encode);
        Ok(serde_json::to_vec(&setup)?)
    }

    fn sign_setup(
        &self,
        key_id: &[u8],
        chain_path: Option<&str>,
        message_hash: &[u8],
        ids: &[u8],
    ) -> Result<Vec<u8>> {
        let mut setup = self.new_setup(SetupKind::Sign, ids, 0)?;
        setup.threshold = setup.parties.len();
        setup.key_id = Some(hex::encode(key_id));
        setup.message_hash = Some(hex::encode(message_hash));
        setup.chain_path = chain_path.map(str::to_string);
        Ok(serde_json::to_vec(&setup)?)
    }

    fn reshare_setup(
        &self,
        keyshare: Handle,
        ids: &[u8],
        old_parties: &[u8],
        new_threshold: usize,
        new_parties: &[u8],
    ) -> Result<Vec<u8>> {
        let keyshare = self.keyshare(keyshare)?;
        let mut setup = self.new_setup(SetupKind::Reshare, ids, new_threshold)?;
        let pick = |indices: &[u8]| -> Result<Vec<String>> {
            indices
                .iter()
                .map(|i| {
                    setup
                        .parties
                        .get(*i as usize)
                        .cloned()
                        .ok_or_else(|| Error::Engine(format!("party index {} out of range", i)))
                })
                .collect()
        };
        let old = pick(old_parties)?;
        let new = pick(new_parties)?;
        setup.old_parties = old;
        setup.parties = new;
        setup.key_id = Some(hex::encode(keyshare.key_id()?));
        Ok(serde_json::to_vec(&setup)?)
    }

    fn decode_message_hash(&self, setup: &[u8]) -> Result<Vec<u8>> {
        let setup = self.decode_setup(setup, SetupKind::Sign)?;
        let hash = setup
            .message_hash
            .ok_or_else(|| Error::Engine("setup carries no message hash".into()))?;
        Ok(hex::decode(hash)?)
    }

    fn keygen_session(&self, setup: &[u8], party_id: &str) -> Result<Handle> {
        self.check_session_creation()?;
        let setup = self.decode_setup(setup, SetupKind::Keygen)?;
        let own_share = random_share(self.key_type);
        let own_chain = match self.key_type {
            KeyType::Ecdsa => rand::random::<[u8; 32]>().to_vec(),
            KeyType::Eddsa => Vec::new(),
        };
        let value = hex::encode(public_value(self.key_type, &own_share)?);
        let expected = others(&setup.parties, party_id);
        self.open_broadcast(
            SessionFamily::Keygen,
            setup,
            party_id,
            own_share,
            value,
            own_chain,
            expected,
            None,
            None,
        )
    }

    fn sign_session(&self, setup: &[u8], party_id: &str, keyshare: Handle) -> Result<Handle> {
        self.check_session_creation()?;
        let setup = self.decode_setup(setup, SetupKind::Sign)?;
        let keyshare = self.keyshare(keyshare)?;

        if setup.key_id.as_deref() != Some(hex::encode(keyshare.key_id()?).as_str()) {
            return Err(Error::Engine("setup was made for another key".into()));
        }
        if let Some(missing) = keyshare.holders.iter().find(|h| !setup.parties.contains(h)) {
            return Err(Error::Engine(format!(
                "local engine needs every share holder to sign, {} is missing",
                missing
            )));
        }

        let own_share = keyshare.share()?;
        let expected = others(&keyshare.holders, party_id);
        self.open_broadcast(
            SessionFamily::Sign,
            setup,
            party_id,
            own_share,
            hex::encode(own_share),
            Vec::new(),
            expected,
            Some(keyshare),
            None,
        )
    }

    fn reshare_session(&self, setup: &[u8], party_id: &str, keyshare: Option<Handle>) -> Result<Handle> {
        self.check_session_creation()?;
        let setup = self.decode_setup(setup, SetupKind::Reshare)?;
        if !setup.parties.iter().any(|p| p == party_id) {
            return Err(Error::Engine(format!("{} is not in the new committee", party_id)));
        }
        let keyshare = keyshare.map(|k| self.keyshare(k)).transpose()?;
        let is_old = setup.old_parties.iter().any(|p| p == party_id);

        let mut outbox = VecDeque::new();
        let own_share = match (&keyshare, is_old) {
            (Some(keyshare), true) => {
                if setup.key_id.as_deref() != Some(hex::encode(keyshare.key_id()?).as_str()) {
                    return Err(Error::Engine("setup was made for another key".into()));
                }
                if let Some(missing) = keyshare.holders.iter().find(|h| !setup.old_parties.contains(h)) {
                    return Err(Error::Engine(format!(
                        "local engine needs every share holder to reshare, {} is missing",
                        missing
                    )));
                }
                let pieces = split(self.key_type, &keyshare.share()?, setup.parties.len());
                let mut own = [0u8; 32];
                for (party, piece) in setup.parties.iter().zip(pieces) {
                    if party == party_id {
                        own = piece;
                        continue;
                    }
                    let message = SimMessage {
                        nonce: setup.nonce.clone(),
                        from: party_id.to_string(),
                        to: vec![party.clone()],
                        value: hex::encode(piece),
                        chain: keyshare.chain_code.clone(),
                        public_key: keyshare.public_key.clone(),
                    };
                    outbox.push_back(serde_json::to_vec(&message)?);
                }
                own
            }
            (None, true) => {
                return Err(Error::Engine(format!("old party {} has no keyshare", party_id)));
            }
            (_, false) => [0u8; 32],
        };

        let expected = others(&setup.old_parties, party_id);
        Ok(self.register(SimSession {
            family: SessionFamily::Reshare,
            setup,
            party_id: party_id.to_string(),
            outbox,
            expected,
            received: BTreeMap::new(),
            own_share,
            own_chain: Vec::new(),
            keyshare,
            migration: None,
            outcome: None,
        }))
    }

    fn migrate_session(
        &self,
        setup: &[u8],
        party_id: &str,
        public_key: &[u8],
        chain_code: &[u8],
        secret: &[u8],
    ) -> Result<Handle> {
        self.check_session_creation()?;
        let setup = self.decode_setup(setup, SetupKind::Keygen)?;
        if let Some(key_id) = &setup.key_id {
            if *key_id != hex::encode(public_key) {
                return Err(Error::Engine("setup was made for another key".into()));
            }
        }
        let own_share: Share = secret
            .try_into()
            .map_err(|_| Error::Engine(format!("secret share must be 32 bytes, got {}", secret.len())))?;
        let value = hex::encode(public_value(self.key_type, &own_share)?);
        let expected = others(&setup.parties, party_id);
        self.open_broadcast(
            SessionFamily::Keygen,
            setup,
            party_id,
            own_share,
            value,
            Vec::new(),
            expected,
            None,
            Some(Migration {
                public_key: public_key.to_vec(),
                chain_code: chain_code.to_vec(),
            }),
        )
    }

    fn output_message(&self, _family: SessionFamily, session: Handle) -> Result<Option<Vec<u8>>> {
        let mut session = self
            .sessions
            .get_mut(&session.0)
            .ok_or_else(|| Error::Engine(format!("unknown session handle {}", session.0)))?;
        Ok(session.outbox.pop_front())
    }

    fn message_receiver(
        &self,
        _family: SessionFamily,
        _session: Handle,
        message: &[u8],
        index: usize,
    ) -> Result<Option<String>> {
        let message: SimMessage = serde_json::from_slice(message)
            .map_err(|e| Error::Engine(format!("invalid message: {}", e)))?;
        Ok(message.to.get(index).cloned())
    }

    fn input_message(&self, _family: SessionFamily, handle: Handle, message: &[u8]) -> Result<bool> {
        let message: SimMessage = serde_json::from_slice(message)
            .map_err(|e| Error::Engine(format!("invalid message: {}", e)))?;
        let mut session = self
            .sessions
            .get_mut(&handle.0)
            .ok_or_else(|| Error::Engine(format!("unknown session handle {}", handle.0)))?;

        if message.nonce != session.setup.nonce {
            return Err(Error::Engine("message belongs to another session".into()));
        }
        if !message.to.contains(&session.party_id) || !session.expected.contains(&message.from) {
            return Err(Error::Engine(format!("unexpected message from {}", message.from)));
        }
        if session.outcome.is_some() {
            return Ok(true);
        }

        session.received.insert(message.from.clone(), message);
        if session.received.len() < session.expected.len() {
            return Ok(false);
        }

        let outcome = self.complete(&session)?;
        session.outcome = Some(outcome);
        Ok(true)
    }

    fn finish(&self, _family: SessionFamily, handle: Handle) -> Result<RawOutput> {
        let outcome = {
            let session = self
                .sessions
                .get(&handle.0)
                .ok_or_else(|| Error::Engine(format!("unknown session handle {}", handle.0)))?;
            match &session.outcome {
                Some(Outcome::Keyshare(keyshare)) => Outcome::Keyshare(keyshare.clone()),
                Some(Outcome::Signature(signature)) => Outcome::Signature(signature.clone()),
                None => return Err(Error::Engine("session is not finished".into())),
            }
        };

        Ok(match outcome {
            Outcome::Keyshare(keyshare) => RawOutput::Keyshare(self.insert_keyshare(keyshare)),
            Outcome::Signature(signature) => RawOutput::Signature(signature),
        })
    }

    fn free_session(&self, _family: SessionFamily, session: Handle) -> Result<()> {
        self.sessions
            .remove(&session.0)
            .ok_or_else(|| Error::Engine(format!("session handle {} freed twice", session.0)))?;
        self.sessions_freed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn keyshare_from_bytes(&self, bytes: &[u8]) -> Result<Handle> {
        let keyshare: SimKeyshare = serde_json::from_slice(bytes)
            .map_err(|e| Error::Engine(format!("invalid keyshare: {}", e)))?;
        if keyshare.key_type != self.key_type {
            return Err(Error::Engine(format!("keyshare is {}, engine is {}", keyshare.key_type, self.key_type)));
        }
        Ok(self.insert_keyshare(keyshare))
    }

    fn keyshare_to_bytes(&self, keyshare: Handle) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.keyshare(keyshare)?)?)
    }

    fn keyshare_public_key(&self, keyshare: Handle) -> Result<Vec<u8>> {
        Ok(hex::decode(self.keyshare(keyshare)?.public_key)?)
    }

    fn keyshare_key_id(&self, keyshare: Handle) -> Result<Vec<u8>> {
        self.keyshare(keyshare)?.key_id()
    }

    fn keyshare_chain_code(&self, keyshare: Handle) -> Result<Vec<u8>> {
        Ok(hex::decode(self.keyshare(keyshare)?.chain_code)?)
    }

    fn derive_child_public_key(&self, keyshare: Handle, path: &str) -> Result<Vec<u8>> {
        let keyshare = self.keyshare(keyshare)?;
        if keyshare.key_type != KeyType::Ecdsa {
            return Err(Error::Engine("child key derivation is ECDSA only".into()));
        }
        let (_, child) = derive_tweak(
            &hex::decode(&keyshare.public_key)?,
            &hex::decode(&keyshare.chain_code)?,
            path,
        )?;
        Ok(encode_point(&child))
    }

    fn free_keyshare(&self, keyshare: Handle) -> Result<()> {
        self.keyshares
            .remove(&keyshare.0)
            .ok_or_else(|| Error::Engine(format!("keyshare handle {} freed twice", keyshare.0)))?;
        self.keyshares_freed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn parse_ids(ids: &[u8]) -> Result<Vec<String>> {
    if ids.is_empty() {
        return Err(Error::Engine("empty committee".into()));
    }
    ids.split(|b| *b == 0)
        .map(|id| {
            String::from_utf8(id.to_vec()).map_err(|e| Error::Engine(format!("party id is not utf-8: {}", e)))
        })
        .collect()
}

fn others(parties: &[String], party_id: &str) -> Vec<String> {
    parties.iter().filter(|p| p.as_str() != party_id).cloned().collect()
}

fn decode_share(value: &str) -> Result<Share> {
    let bytes = hex::decode(value)?;
    bytes
        .try_into()
        .map_err(|_| Error::Engine("share must be 32 bytes".into()))
}

fn to_scalar(share: &Share) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*share).into())
}

fn from_scalar(scalar: &Scalar) -> Share {
    let mut out = [0u8; 32];
    out.copy_from_slice(&scalar.to_bytes());
    out
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    k256::PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|e| Error::Engine(format!("invalid point: {}", e)))
}

fn random_share(key_type: KeyType) -> Share {
    match key_type {
        KeyType::Ecdsa => from_scalar(&Scalar::random(&mut OsRng)),
        KeyType::Eddsa => rand::random(),
    }
}

fn combine(key_type: KeyType, a: &Share, b: &Share) -> Share {
    match key_type {
        KeyType::Ecdsa => from_scalar(&(to_scalar(a) + to_scalar(b))),
        KeyType::Eddsa => {
            let mut out = *a;
            for (o, x) in out.iter_mut().zip(b) {
                *o ^= x;
            }
            out
        }
    }
}

/// `n` random pieces that combine back to `secret`
fn split(key_type: KeyType, secret: &Share, n: usize) -> Vec<Share> {
    let mut pieces: Vec<Share> = (1..n).map(|_| random_share(key_type)).collect();
    let mut last = *secret;
    for piece in &pieces {
        last = match key_type {
            KeyType::Ecdsa => from_scalar(&(to_scalar(&last) - to_scalar(piece))),
            KeyType::Eddsa => combine(key_type, &last, piece),
        };
    }
    pieces.push(last);
    pieces
}

/// What a party reveals about its share during keygen
fn public_value(key_type: KeyType, share: &Share) -> Result<Vec<u8>> {
    match key_type {
        KeyType::Ecdsa => Ok(encode_point(&(ProjectivePoint::GENERATOR * to_scalar(share)))),
        KeyType::Eddsa => Ok(share.to_vec()),
    }
}

fn combine_public(key_type: KeyType, values: &[Vec<u8>]) -> Result<Vec<u8>> {
    match key_type {
        KeyType::Ecdsa => {
            let mut sum = ProjectivePoint::IDENTITY;
            for value in values {
                sum += decode_point(value)?;
            }
            Ok(encode_point(&sum))
        }
        KeyType::Eddsa => {
            let mut seed = [0u8; 32];
            for value in values {
                let piece: Share = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Engine("share must be 32 bytes".into()))?;
                seed = combine(key_type, &seed, &piece);
            }
            public_key_of(key_type, &seed)
        }
    }
}

fn public_key_of(key_type: KeyType, secret: &Share) -> Result<Vec<u8>> {
    match key_type {
        KeyType::Ecdsa => public_value(key_type, secret),
        KeyType::Eddsa => Ok(ed25519_dalek::SigningKey::from_bytes(secret)
            .verifying_key()
            .to_bytes()
            .to_vec()),
    }
}

/// Non-hardened BIP32 tweak along `path`, and the derived public key
fn derive_tweak(public_key: &[u8], chain_code: &[u8], path: &str) -> Result<(Scalar, ProjectivePoint)> {
    let derivation_path: DerivationPath = path
        .parse()
        .map_err(|e| Error::Engine(format!("Invalid path: {}", e)))?;
    let mut point = decode_point(public_key)?;
    let mut chain: [u8; 32] = chain_code
        .try_into()
        .map_err(|_| Error::Engine("chain code must be 32 bytes".into()))?;
    let mut tweak = Scalar::ZERO;

    let components: Vec<_> = derivation_path.into_iter().collect();
    for child_index in components {
        let index = match child_index {
            ChildIndex::Normal(idx) => *idx,
            ChildIndex::Hardened(_) => {
                return Err(Error::Engine("Hardened derivation not supported".into()));
            }
        };

        let mut hmac = Hmac::<Sha512>::new_from_slice(&chain)
            .map_err(|e| Error::Engine(e.to_string()))?;
        hmac.update(&encode_point(&point));
        hmac.update(&index.to_be_bytes());
        let result = hmac.finalize().into_bytes();

        let mut left = [0u8; 32];
        left.copy_from_slice(&result[..32]);
        let il = to_scalar(&left);
        point += ProjectivePoint::GENERATOR * il;
        tweak += il;
        chain.copy_from_slice(&result[32..]);
    }

    Ok((tweak, point))
}

fn sign(
    key_type: KeyType,
    secret: &Share,
    keyshare: &SimKeyshare,
    chain_path: Option<&str>,
    hash: &[u8],
) -> Result<Vec<u8>> {
    match key_type {
        KeyType::Ecdsa => {
            let mut scalar = to_scalar(secret);
            if let Some(path) = chain_path {
                let (tweak, _) = derive_tweak(
                    &hex::decode(&keyshare.public_key)?,
                    &hex::decode(&keyshare.chain_code)?,
                    path,
                )?;
                scalar += tweak;
            }
            let key = k256::ecdsa::SigningKey::from_bytes(&scalar.to_bytes())
                .map_err(|e| Error::Engine(e.to_string()))?;
            let (signature, recovery_id) = key
                .sign_prehash_recoverable(hash)
                .map_err(|e| Error::Engine(e.to_string()))?;
            let mut out = signature.to_bytes().to_vec();
            out.push(recovery_id.to_byte());
            Ok(out)
        }
        KeyType::Eddsa => {
            let key = ed25519_dalek::SigningKey::from_bytes(secret);
            Ok(key.sign(hash).to_bytes().to_vec())
        }
    }
}
