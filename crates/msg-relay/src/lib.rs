//! Message Relay Library
//!
//! Data model shared by every party talking to the store-and-forward relay,
//! plus an in-memory [`RelayStore`] holding session membership, setup
//! payloads and per-party mailboxes for local relays and tests.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Message not found: {0}")]
    NotFound(String),
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Session expired: {0}")]
    SessionExpired(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Hex encoded BLAKE3 digest.
///
/// Used for message content hashes and for deriving relay tags from signed
/// messages. Not a security boundary: bodies are authenticated by the
/// transport encryption.
pub fn digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// A protocol message as stored and delivered by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Session identifier
    pub session_id: String,
    /// Sender party ID
    pub from: String,
    /// Recipient party IDs
    pub to: Vec<String>,
    /// Base64 of the sealed payload
    pub body: String,
    /// Digest of `body`
    pub hash: String,
    /// Per-sender sequence number
    pub sequence_no: u64,
}

impl ProtocolMessage {
    /// Build a message addressed to a single recipient, hashing the body.
    pub fn new(session_id: &str, from: &str, to: &str, body: String, sequence_no: u64) -> Self {
        let hash = digest(body.as_bytes());
        Self {
            session_id: session_id.to_string(),
            from: from.to_string(),
            to: vec![to.to_string()],
            body,
            hash,
            sequence_no,
        }
    }

    /// Check the required fields and that `hash` matches `body`.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.is_empty() || self.from.is_empty() || self.to.is_empty() {
            return Err(RelayError::InvalidFormat(
                "session_id, from and to are required".into(),
            ));
        }
        if digest(self.body.as_bytes()) != self.hash {
            return Err(RelayError::InvalidFormat(format!(
                "hash mismatch for message from {}",
                self.from
            )));
        }
        Ok(())
    }
}

/// Everything the relay keeps for one session.
#[derive(Debug, Clone)]
struct SessionState {
    /// Parties that registered presence
    parties: Vec<String>,
    /// Committee announced by the leader
    started: Vec<String>,
    /// Parties that marked the session complete
    completed: Vec<String>,
    /// Setup payloads keyed by tag
    setup: HashMap<String, String>,
    /// Queued messages keyed by `party/tag`
    mailboxes: HashMap<String, Vec<ProtocolMessage>>,
    /// Creation timestamp
    created_at: DateTime<Utc>,
    /// Expiration timestamp
    expires_at: DateTime<Utc>,
}

impl SessionState {
    fn new(ttl_seconds: i64) -> Self {
        let now = Utc::now();
        Self {
            parties: Vec::new(),
            started: Vec::new(),
            completed: Vec::new(),
            setup: HashMap::new(),
            mailboxes: HashMap::new(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_seconds),
        }
    }
}

fn append_unique(list: &mut Vec<String>, parties: &[String]) {
    for party in parties {
        if !list.contains(party) {
            list.push(party.clone());
        }
    }
}

fn mailbox_key(party_id: &str, tag: &str) -> String {
    format!("{}/{}", party_id, tag)
}

/// In-memory relay store
#[derive(Clone)]
pub struct RelayStore {
    /// Sessions indexed by ID
    sessions: Arc<DashMap<String, SessionState>>,
    /// Default TTL in seconds
    ttl_seconds: i64,
}

impl RelayStore {
    /// Create a new relay store
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl_seconds,
        }
    }

    /// Register parties for a session, creating it if needed
    pub fn register(&self, session_id: &str, parties: &[String]) {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(self.ttl_seconds));
        append_unique(&mut session.parties, parties);
        debug!(session_id, parties = ?session.parties, "Parties registered");
    }

    /// Parties registered for a session; empty for unknown sessions
    pub fn parties(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|s| s.parties.clone())
            .unwrap_or_default()
    }

    /// Record the committee the leader started the session with
    pub fn start(&self, session_id: &str, parties: &[String]) {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(self.ttl_seconds));
        session.started = parties.to_vec();
    }

    /// Committee of a started session; empty until the leader starts it
    pub fn started(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|s| s.started.clone())
            .unwrap_or_default()
    }

    /// Store a setup payload under a tag, replacing any earlier one
    pub fn put_setup(&self, session_id: &str, tag: &str, payload: String) {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(self.ttl_seconds));
        session.setup.insert(tag.to_string(), payload);
    }

    /// Fetch a setup payload
    pub fn get_setup(&self, session_id: &str, tag: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.setup.get(tag).cloned())
    }

    /// Queue a message in the mailbox of every recipient.
    ///
    /// A message whose hash is already queued for a recipient replaces the
    /// queued copy.
    pub fn put_message(&self, message: ProtocolMessage, tag: &str) -> Result<()> {
        message.validate()?;

        let mut session = self
            .sessions
            .entry(message.session_id.clone())
            .or_insert_with(|| SessionState::new(self.ttl_seconds));

        for recipient in &message.to {
            let mailbox = session
                .mailboxes
                .entry(mailbox_key(recipient, tag))
                .or_default();
            mailbox.retain(|m| m.hash != message.hash);
            mailbox.push(message.clone());
        }
        Ok(())
    }

    /// Messages queued for a party, ordered by sequence number
    pub fn messages(&self, session_id: &str, party_id: &str, tag: &str) -> Vec<ProtocolMessage> {
        let mut messages = self
            .sessions
            .get(session_id)
            .and_then(|s| s.mailboxes.get(&mailbox_key(party_id, tag)).cloned())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.sequence_no);
        messages
    }

    /// Remove a consumed message from a party's mailbox
    pub fn delete_message(&self, session_id: &str, party_id: &str, tag: &str, hash: &str) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::NotFound(session_id.to_string()))?;
        let mailbox = session
            .mailboxes
            .get_mut(&mailbox_key(party_id, tag))
            .ok_or_else(|| RelayError::NotFound(hash.to_string()))?;

        let before = mailbox.len();
        mailbox.retain(|m| m.hash != hash);
        if mailbox.len() == before {
            return Err(RelayError::NotFound(hash.to_string()));
        }
        Ok(())
    }

    /// Mark parties as done with the session
    pub fn complete(&self, session_id: &str, parties: &[String]) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::NotFound(session_id.to_string()))?;
        append_unique(&mut session.completed, parties);
        Ok(())
    }

    /// Parties that completed the session
    pub fn completed(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|s| s.completed.clone())
            .unwrap_or_default()
    }

    /// Drop a session with all its payloads and mailboxes
    pub fn end(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Check whether a session is still live
    pub fn is_live(&self, session_id: &str) -> Result<bool> {
        match self.sessions.get(session_id) {
            Some(session) if session.expires_at <= Utc::now() => {
                Err(RelayError::SessionExpired(session_id.to_string()))
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Age of a session in seconds
    pub fn age_seconds(&self, session_id: &str) -> Option<i64> {
        self.sessions
            .get(session_id)
            .map(|s| (Utc::now() - s.created_at).num_seconds())
    }

    /// Remove expired sessions
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, s| s.expires_at > now);
    }
}

impl Default for RelayStore {
    fn default() -> Self {
        Self::new(3600) // 1 hour default TTL
    }
}
